//! Per-invocation settings handed to the helper.
//!
//! Built once by the controller, served as JSON in reply to
//! `GetSessionSettings`, and never mutated afterwards.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 24-bit RGB colour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb24 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb24 {
    pub const BLACK: Self = Self::new(0, 0, 0);
    pub const WHITE: Self = Self::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl fmt::Display for Rgb24 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid colour {0:?}, expected RRGGBB hex")]
pub struct InvalidColor(String);

impl FromStr for Rgb24 {
    type Err = InvalidColor;

    /// Parses `RRGGBB`, with or without a leading `#`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        let invalid = || InvalidColor(s.to_owned());
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(invalid());
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
        Ok(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

/// How the source image and selection are presented to the plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCase {
    FlatImageNoSelection,
    FlatImageWithSelection,
    FloatingSelection,
    #[default]
    EditableTransparencyNoSelection,
    EditableTransparencyWithSelection,
    ProtectedTransparencyNoSelection,
    ProtectedTransparencyWithSelection,
}

impl FilterCase {
    /// The case used for a layer with editable transparency.
    pub fn for_selection(has_mask: bool) -> Self {
        if has_mask {
            Self::EditableTransparencyWithSelection
        } else {
            Self::EditableTransparencyNoSelection
        }
    }

    pub fn has_selection(self) -> bool {
        matches!(
            self,
            Self::FlatImageWithSelection
                | Self::FloatingSelection
                | Self::EditableTransparencyWithSelection
                | Self::ProtectedTransparencyWithSelection
        )
    }
}

/// Host UI scaling, for plugins that draw their own dialogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiScaling {
    pub dpi_aware: bool,
    pub scale_percent: u32,
}

impl Default for UiScaling {
    fn default() -> Self {
        Self {
            dpi_aware: true,
            scale_percent: 100,
        }
    }
}

/// Everything the helper needs to run one filter invocation.
///
/// The three blob paths are always set; the files behind them exist only when
/// the controller staged a value. The helper may write updated values back to
/// the same paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub repeat_without_prompting: bool,
    pub show_plugin_about_box: bool,
    pub primary_color: Rgb24,
    pub secondary_color: Rgb24,
    pub document_dpi_x: f64,
    pub document_dpi_y: f64,
    pub filter_case: FilterCase,
    pub source_image_path: PathBuf,
    pub destination_image_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_mask_path: Option<PathBuf>,
    pub parameter_data_path: PathBuf,
    pub pseudo_resources_path: PathBuf,
    pub descriptor_registry_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<PathBuf>,
    #[serde(default)]
    pub ui: UiScaling,
}

impl SessionSettings {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
