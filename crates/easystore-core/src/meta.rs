//! Canonical metadata serialization
//!
//! Per-file metadata is stored as JSON in the META region. The canonical
//! form is: object keys sorted lexicographically at every nesting level, no
//! whitespace between tokens, UTF-8. `serde_json`'s default map is ordered,
//! so serializing a [`serde_json::Value`] produces exactly this form; the
//! helpers here are the single entry point so the rule lives in one place.
//!
//! Keys the writer injects into every blob:
//!
//! - `size`: original payload length in bytes (also for external files,
//!   whose index entry records `data_length = 0`)
//! - `is_external` / `external_key`: present only on diverted files

use serde_json::Value;

use crate::error::{CoreError, Result};

/// Largest metadata blob accepted for a single file.
pub const MAX_META_SIZE: usize = 1024 * 1024;

/// Serialize a metadata value to its canonical byte form.
pub fn canonical_meta_bytes(meta: &Value) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(meta)
        .map_err(|e| CoreError::Config(format!("metadata not serializable: {e}")))?;
    if bytes.len() > MAX_META_SIZE {
        return Err(CoreError::Config(format!(
            "metadata too large: {} bytes (max {})",
            bytes.len(),
            MAX_META_SIZE
        )));
    }
    Ok(bytes)
}

/// Parse a metadata blob read back from a container.
pub fn parse_meta_bytes(raw: &[u8]) -> Result<Value> {
    serde_json::from_slice(raw)
        .map_err(|e| CoreError::CorruptContainer(format!("metadata is not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_no_whitespace() {
        let meta = json!({"zeta": 1, "alpha": {"y": true, "x": false}, "mime": "text/plain"});
        let bytes = canonical_meta_bytes(&meta).unwrap();
        assert_eq!(
            bytes,
            br#"{"alpha":{"x":false,"y":true},"mime":"text/plain","zeta":1}"#
        );
    }

    #[test]
    fn test_roundtrip() {
        let meta = json!({"size": 42, "mime": "image/png", "tags": ["a", "b"]});
        let bytes = canonical_meta_bytes(&meta).unwrap();
        assert_eq!(parse_meta_bytes(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_canonical_form_is_stable() {
        // Same logical object, different construction order
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(
            canonical_meta_bytes(&a).unwrap(),
            canonical_meta_bytes(&b).unwrap()
        );
    }

    #[test]
    fn test_oversized_meta_rejected() {
        let meta = json!({"blob": "x".repeat(MAX_META_SIZE)});
        assert!(canonical_meta_bytes(&meta).is_err());
    }

    #[test]
    fn test_garbage_blob_rejected() {
        assert!(parse_meta_bytes(b"{not json").is_err());
    }
}
