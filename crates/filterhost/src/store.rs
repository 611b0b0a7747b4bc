//! Last-used parameters per plugin.

use std::collections::HashMap;

use crate::blob::{FilterParameters, PseudoResourceCollection};
use crate::plugin::PluginIdentity;

/// State a plugin left behind after a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredState {
    pub parameters: Option<FilterParameters>,
    pub pseudo_resources: Option<PseudoResourceCollection>,
}

/// Maps a plugin identity to the parameters from its last successful run, so
/// "repeat last filter" can replay them.
#[derive(Debug, Default)]
pub struct ParameterStore {
    entries: HashMap<PluginIdentity, StoredState>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &PluginIdentity) -> Option<&StoredState> {
        self.entries.get(identity)
    }

    /// Remember what a run returned. Values the helper did not write back
    /// leave the previously stored ones in place.
    pub fn record(
        &mut self,
        identity: PluginIdentity,
        parameters: Option<FilterParameters>,
        pseudo_resources: Option<PseudoResourceCollection>,
    ) {
        let entry = self.entries.entry(identity).or_default();
        if parameters.is_some() {
            entry.parameters = parameters;
        }
        if pseudo_resources.is_some() {
            entry.pseudo_resources = pseudo_resources;
        }
    }

    pub fn forget(&mut self, identity: &PluginIdentity) -> Option<StoredState> {
        self.entries.remove(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::Blob;

    fn identity(entry: &str) -> PluginIdentity {
        PluginIdentity {
            file_name: "Filters.8bf".into(),
            entry_point: entry.into(),
        }
    }

    fn params(bytes: &[u8]) -> FilterParameters {
        FilterParameters {
            parameters: Some(Blob::from(bytes)),
            plugin_data: None,
        }
    }

    #[test]
    fn entries_are_keyed_by_file_and_entry_point() {
        let mut store = ParameterStore::new();
        store.record(identity("Blur"), Some(params(b"a")), None);
        store.record(identity("Sharpen"), Some(params(b"b")), None);

        assert_eq!(store.len(), 2);
        assert_eq!(
            store.get(&identity("Blur")).unwrap().parameters,
            Some(params(b"a"))
        );
        assert!(store.get(&identity("Emboss")).is_none());
    }

    #[test]
    fn absent_values_keep_previous_ones() {
        let mut store = ParameterStore::new();
        store.record(identity("Blur"), Some(params(b"a")), None);
        store.record(identity("Blur"), None, Some(PseudoResourceCollection::default()));

        let state = store.get(&identity("Blur")).unwrap();
        assert_eq!(state.parameters, Some(params(b"a")));
        assert!(state.pseudo_resources.is_some());

        assert!(store.forget(&identity("Blur")).is_some());
        assert!(store.is_empty());
    }
}
