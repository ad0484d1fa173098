use crate::types::{ImageId, ShortId};
use serde::Serialize;

/// Identity of an image record in the store.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImageIdentity {
    pub image_id: ImageId,
    pub short_id: ShortId,
}

/// Compute an image identity from its configuration and a caller-chosen nonce.
///
/// Empty images created from the same configuration must still get distinct
/// ids, so the nonce has to differ per call (creation time, pid, counter).
pub fn compute_image_id(config: &serde_json::Value, nonce: &[u8]) -> ImageIdentity {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"imgdelta-image:");
    hasher.update(config.to_string().as_bytes());
    hasher.update(b"\x00nonce:");
    hasher.update(nonce);

    let hex = hasher.finalize().to_hex().to_string();
    let short = hex[..12].to_owned();

    ImageIdentity {
        image_id: ImageId::new(hex),
        short_id: ShortId::new(short),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_same_id() {
        let config = serde_json::json!({"Cmd": ["sh"]});
        let a = compute_image_id(&config, b"n1");
        let b = compute_image_id(&config, b"n1");
        assert_eq!(a, b);
        assert_eq!(a.image_id.len(), 64);
        assert_eq!(a.short_id.len(), 12);
        assert!(a.image_id.starts_with(a.short_id.as_str()));
    }

    #[test]
    fn nonce_changes_id() {
        let config = serde_json::json!({});
        let a = compute_image_id(&config, b"n1");
        let b = compute_image_id(&config, b"n2");
        assert_ne!(a.image_id, b.image_id);
    }

    #[test]
    fn config_changes_id() {
        let a = compute_image_id(&serde_json::json!({"a": 1}), b"n");
        let b = compute_image_id(&serde_json::json!({"a": 2}), b"n");
        assert_ne!(a.image_id, b.image_id);
    }
}
