//! Version information for filterhost.

use crate::bridge::protocol::PROTOCOL_VERSION;
use crate::raster::RASTER_FORMAT_VERSION;

/// filterhost version from Cargo.toml
pub const FILTERHOST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Versions a controller and helper must agree on.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub filterhost: &'static str,
    /// Command protocol revision.
    pub protocol: u32,
    /// Raster interchange format revision.
    pub raster_format: i32,
    /// CPU architecture this binary was built for.
    pub arch: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            filterhost: FILTERHOST_VERSION,
            protocol: PROTOCOL_VERSION,
            raster_format: RASTER_FORMAT_VERSION,
            arch: std::env::consts::ARCH,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.filterhost, FILTERHOST_VERSION);
        assert_eq!(info.protocol, PROTOCOL_VERSION);
        assert_eq!(info.raster_format, RASTER_FORMAT_VERSION);
    }

    #[test]
    fn version_info_serializes() {
        let info = VersionInfo {
            filterhost: "0.1.0",
            protocol: 1,
            raster_format: 1,
            arch: "x86",
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "filterhost": "0.1.0",
          "protocol": 1,
          "raster_format": 1,
          "arch": "x86"
        }
        "#);
    }
}
