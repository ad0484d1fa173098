use serde::{Deserialize, Serialize};

/// The only header version this implementation reads or writes.
pub const DELTA_VERSION: u64 = 2;

/// JSON header at the front of a delta stream.
///
/// Field order is part of the wire format: `version` is serialized first,
/// then `dockerConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaMetadata {
    pub version: u64,
    /// Opaque image configuration of the destination image.
    #[serde(rename = "dockerConfig", default)]
    pub docker_config: serde_json::Value,
}

impl DeltaMetadata {
    pub fn new(docker_config: serde_json::Value) -> Self {
        Self {
            version: DELTA_VERSION,
            docker_config,
        }
    }
}

/// Whether a delta stream carries a header.
///
/// `Legacy` streams are raw batch bytes with no header or separator; both
/// ends must agree on the mode out of band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderMode {
    #[default]
    V2,
    Legacy,
}

impl HeaderMode {
    pub fn has_header(self) -> bool {
        matches!(self, HeaderMode::V2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_version_before_config() {
        let meta = DeltaMetadata::new(serde_json::json!({"Env": ["A=1"]}));
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"version":2,"dockerConfig":{"Env":["A=1"]}}"#);
    }

    #[test]
    fn missing_config_defaults_to_null() {
        let meta: DeltaMetadata = serde_json::from_str(r#"{"version":2}"#).unwrap();
        assert!(meta.docker_config.is_null());
    }

    #[test]
    fn default_mode_has_header() {
        assert!(HeaderMode::default().has_header());
        assert!(!HeaderMode::Legacy.has_header());
    }
}
