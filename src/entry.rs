//! Typed dictionary entry model.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// A cleaned, validated dictionary entry ready for storage and enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Deterministic id derived from `(headword, language, primary gloss)`.
    pub id: String,
    /// Cleaned headword.
    pub headword: String,
    /// Normalized IPA transcription (may be empty for orthography-only sources).
    pub ipa: String,
    /// ISO-639 language code, at most 3 characters.
    pub language: String,
    /// Cleaned definition text.
    pub definition: String,
    /// Etymology free text, when the source carries one.
    pub etymology: Option<String>,
    /// Part-of-speech tag, when the source carries one.
    pub pos_tag: Option<String>,
    /// Dense semantic vector; filled by the enrichment pipeline.
    pub embedding: Option<Vec<f32>>,
    /// Checksum of the raw record this entry was cleaned from.
    pub raw_checksum: String,
    /// Identifier of the originating data source.
    pub source_id: String,
    /// Ordered cleaner `name:version` list that produced this entry.
    pub pipeline_fingerprint: String,
    /// Data quality in `[0, 1]` derived from validation.
    pub quality: f64,
    /// Validation rule failures recorded against this entry.
    pub validation_errors: Vec<String>,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at_epoch_ms: u64,
}

impl Entry {
    /// Primary gloss: the first ` | `-separated segment of the definition.
    pub fn primary_gloss(&self) -> &str {
        primary_gloss(&self.definition)
    }
}

/// First ` | `-separated segment of a definition.
pub fn primary_gloss(definition: &str) -> &str {
    definition.split(" | ").next().unwrap_or("").trim()
}

/// Deterministic entry id: `entry_` plus the first 16 hex characters of
/// SHA-256 over `(headword, language, primary gloss)` joined with unit
/// separators so field boundaries cannot collide.
pub fn entry_id(headword: &str, language: &str, primary_gloss: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(headword.as_bytes());
    hasher.update([0x1f]);
    hasher.update(language.as_bytes());
    hasher.update([0x1f]);
    hasher.update(primary_gloss.as_bytes());
    let digest = hasher.finalize();
    format!("entry_{}", &hex::encode(digest)[..16])
}

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn epoch_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_is_deterministic() {
        let a = entry_id("father", "en", "male parent");
        let b = entry_id("father", "en", "male parent");
        assert_eq!(a, b);
        assert!(a.starts_with("entry_"));
        assert_eq!(a.len(), "entry_".len() + 16);
    }

    #[test]
    fn entry_id_separates_fields() {
        // Without separators "ab"+"c" and "a"+"bc" would collide.
        assert_ne!(entry_id("ab", "c", ""), entry_id("a", "bc", ""));
    }

    #[test]
    fn primary_gloss_takes_first_segment() {
        assert_eq!(primary_gloss("male parent | a priest"), "male parent");
        assert_eq!(primary_gloss("single"), "single");
        assert_eq!(primary_gloss(""), "");
    }
}
