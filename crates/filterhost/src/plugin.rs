//! Plugin descriptor served to the helper by `GetPluginDescriptor`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one filter: the plugin module and the entry point inside it.
///
/// Parameter reuse is keyed on this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginIdentity {
    pub file_name: String,
    pub entry_point: String,
}

impl fmt::Display for PluginIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.file_name, self.entry_point)
    }
}

/// Metadata describing the filter to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Path of the plugin module as the helper should load it.
    pub file_name: String,
    pub entry_point: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub has_about_box: bool,
}

impl PluginDescriptor {
    pub fn new(file_name: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            entry_point: entry_point.into(),
            category: String::new(),
            title: String::new(),
            has_about_box: false,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_about_box(mut self, has_about_box: bool) -> Self {
        self.has_about_box = has_about_box;
        self
    }

    pub fn identity(&self) -> PluginIdentity {
        PluginIdentity {
            file_name: self.file_name.clone(),
            entry_point: self.entry_point.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_serializes() {
        let descriptor = PluginDescriptor::new("Blur.8bf", "GaussianBlur")
            .with_category("Blur")
            .with_title("Gaussian Blur...");
        insta::assert_json_snapshot!(descriptor, @r#"
        {
          "file_name": "Blur.8bf",
          "entry_point": "GaussianBlur",
          "category": "Blur",
          "title": "Gaussian Blur...",
          "has_about_box": false
        }
        "#);
    }

    #[test]
    fn optional_fields_default() {
        let descriptor: PluginDescriptor =
            serde_json::from_str(r#"{"file_name":"a.8bf","entry_point":"main"}"#).unwrap();
        assert_eq!(descriptor, PluginDescriptor::new("a.8bf", "main"));
        assert_eq!(descriptor.identity().to_string(), "a.8bf!main");
    }
}
