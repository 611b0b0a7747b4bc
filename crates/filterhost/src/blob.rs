//! Structured values staged as standalone JSON files.
//!
//! Filter parameters, pseudo-resources, and the descriptor registry are too
//! large or too optional to travel inline. The controller writes them into the
//! scratch directory, the helper reads them and may write updated values back
//! to the same paths. Opaque byte payloads are base64 strings in the JSON.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque bytes, serialized as base64.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Blob {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// The plugin's saved parameters from a previous run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterParameters {
    /// Parameters the plugin exposes to the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Blob>,
    /// Private state the plugin keeps between runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_data: Option<Blob>,
}

impl FilterParameters {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_none() && self.plugin_data.is_none()
    }
}

/// A document resource the plugin stores alongside its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PseudoResource {
    /// Four-character resource type.
    pub key: String,
    pub index: u32,
    pub data: Blob,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PseudoResourceCollection(pub Vec<PseudoResource>);

impl PseudoResourceCollection {
    pub fn get(&self, key: &str, index: u32) -> Option<&PseudoResource> {
        self.0.iter().find(|r| r.key == key && r.index == index)
    }

    /// Insert or replace the resource with the same key and index.
    pub fn upsert(&mut self, resource: PseudoResource) {
        match self
            .0
            .iter_mut()
            .find(|r| r.key == resource.key && r.index == resource.index)
        {
            Some(existing) => *existing = resource,
            None => self.0.push(resource),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Scripting descriptors keyed by plugin-defined name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DescriptorRegistry(pub BTreeMap<String, Blob>);

impl DescriptorRegistry {
    pub fn get(&self, key: &str) -> Option<&Blob> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Blob) -> Option<Blob> {
        self.0.insert(key.into(), value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Write `value` to `path` as JSON, replacing any existing file.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), BlobError> {
    let bytes = serde_json::to_vec(value).map_err(|source| BlobError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, bytes).map_err(|source| BlobError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read an optional value. A missing file means the value is absent.
pub fn read_optional_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, BlobError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(BlobError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| BlobError::Json {
            path: path.to_path_buf(),
            source,
        })
}
