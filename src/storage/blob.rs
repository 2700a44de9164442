//! Blob content encoding.
//!
//! JSON files are stored pretty-printed so that history stays readable in
//! any git tool; text files are stored with unix line endings and a trailing
//! newline.

use serde_json::Value;

use crate::storage::error::{StorageError, StorageResult};

/// serialize a JSON value the way it is stored in a blob
pub fn json_to_bytes(value: &Value) -> StorageResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// parse the blob of a JSON file
pub fn bytes_to_json(bytes: &[u8], path: &str) -> StorageResult<Value> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::corrupted(path, e.to_string()))
}

/// normalize text content: `\r\n` becomes `\n` and a missing final newline is added
///
/// Empty text stays empty.
pub fn sanitize_text(text: &str) -> String {
    let mut sanitized = text.replace("\r\n", "\n");
    if !sanitized.is_empty() && !sanitized.ends_with('\n') {
        sanitized.push('\n');
    }
    sanitized
}

/// decode the blob of a text file
pub fn bytes_to_text(bytes: &[u8], path: &str) -> StorageResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| StorageError::corrupted(path, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_is_pretty() {
        let bytes = json_to_bytes(&json!({"a": {"b": 1}})).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\n  \"a\""));
        assert!(text.ends_with("}\n"));
        assert_eq!(bytes_to_json(&bytes, "/a.json").unwrap(), json!({"a": {"b": 1}}));
    }

    #[test]
    fn test_invalid_json_is_corruption() {
        let err = bytes_to_json(b"{", "/a.json").unwrap_err();
        assert!(matches!(err, StorageError::CorruptedData { .. }));
    }

    #[test]
    fn test_sanitize_text() {
        assert_eq!(sanitize_text("a\r\nb"), "a\nb\n");
        assert_eq!(sanitize_text("a\n"), "a\n");
        assert_eq!(sanitize_text(""), "");
    }
}
