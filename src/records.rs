//! Raw record model and content checksumming.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Where a raw record came from inside its source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Path of the file the record was read from.
    pub file_path: String,
    /// Line number (or record offset) within the file, 1-based.
    pub line_no: u64,
}

/// An immutable, checksummed record as parsed from a source file.
///
/// The payload is schemaless; the cleaner pipeline is the only boundary that
/// turns it into a typed entry. The checksum is content-addressed: identical
/// payloads collide regardless of origin, which is how ingest deduplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Identifier of the data source this record belongs to.
    pub source_id: String,
    /// Parsed, schemaless payload.
    pub payload: Value,
    /// Hex-encoded SHA-256 of the canonical payload serialization.
    pub checksum: String,
    /// File/line provenance.
    pub origin: Origin,
}

impl RawRecord {
    /// Builds a record, canonicalizing the payload and computing its checksum.
    pub fn new(source_id: impl Into<String>, payload: Value, origin: Origin) -> Self {
        let payload = canonicalize(payload);
        let checksum = payload_checksum(&payload);
        Self {
            source_id: source_id.into(),
            payload,
            checksum,
            origin,
        }
    }

    /// Convenience accessor for a string field of the payload.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }
}

/// Hex SHA-256 over the canonical serialization of a payload.
///
/// Canonical means: object keys in sorted order (the default `serde_json`
/// map representation) and every string NFC-normalized. Two payloads that
/// differ only in key order or Unicode composition hash identically.
pub fn payload_checksum(payload: &Value) -> String {
    let canonical = canonicalize(payload.clone());
    let serialized = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&serialized);
    hex::encode(hasher.finalize())
}

/// Recursively NFC-normalizes every string (keys included) in a JSON value.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(nfc(&text)),
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (nfc(&key), canonicalize(value)))
                .collect(),
        ),
        other => other,
    }
}

fn nfc(input: &str) -> String {
    input.nfc().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn origin() -> Origin {
        Origin {
            file_path: "test.jsonl".to_string(),
            line_no: 1,
        }
    }

    #[test]
    fn checksum_ignores_key_order() {
        let a = json!({"headword": "father", "language": "en"});
        let b = json!({"language": "en", "headword": "father"});
        assert_eq!(payload_checksum(&a), payload_checksum(&b));
    }

    #[test]
    fn checksum_ignores_unicode_composition() {
        // "é" precomposed vs "e" + combining acute.
        let composed = json!({"headword": "caf\u{e9}"});
        let decomposed = json!({"headword": "cafe\u{301}"});
        assert_eq!(payload_checksum(&composed), payload_checksum(&decomposed));
    }

    #[test]
    fn checksum_differs_for_different_payloads() {
        let a = json!({"headword": "father"});
        let b = json!({"headword": "mother"});
        assert_ne!(payload_checksum(&a), payload_checksum(&b));
    }

    #[test]
    fn checksum_is_64_hex_chars() {
        let record = RawRecord::new("src", json!({"headword": "water"}), origin());
        assert_eq!(record.checksum.len(), 64);
        assert!(record.checksum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn field_reads_string_values() {
        let record = RawRecord::new("src", json!({"headword": "water", "n": 3}), origin());
        assert_eq!(record.field("headword"), Some("water"));
        assert_eq!(record.field("n"), None);
        assert_eq!(record.field("missing"), None);
    }
}
