//! Composable validation rules over typed entries.

use crate::cleaners::is_ipa_char;
use crate::entry::Entry;

/// ISO-639 codes this corpus recognizes, plus proto-language conventions.
const KNOWN_LANGUAGE_CODES: &[&str] = &[
    "en", "de", "nl", "af", "yi", "sv", "no", "da", "is", "fo", // Germanic
    "fr", "es", "it", "pt", "ro", "ca", "la", // Romance
    "ru", "uk", "pl", "cs", "sk", "bg", "lt", "lv", // Slavic / Baltic
    "el", "grc", // Greek
    "sa", "hi", "ur", "fa", "ku", "ps", "bn", "pa", // Indo-Iranian
    "ga", "gd", "cy", "br", "gv", "sga", // Celtic
    "sq", "hy", // Albanian, Armenian
    "pie", "ine", // proto-languages
];

/// One validation rule against an entry field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Field must be present and non-empty.
    Required(Field),
    /// Field must be at most this many characters.
    MaxLen(Field, usize),
    /// IPA must only use whitelisted characters (empty IPA passes; absence
    /// is Required's concern).
    IpaCharset,
    /// Language code must be a known ISO-639 code.
    Iso639,
}

/// Entry fields addressable by rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// `headword`
    Headword,
    /// `ipa`
    Ipa,
    /// `language`
    Language,
    /// `definition`
    Definition,
    /// `etymology`
    Etymology,
}

impl Field {
    fn name(&self) -> &'static str {
        match self {
            Field::Headword => "headword",
            Field::Ipa => "ipa",
            Field::Language => "language",
            Field::Definition => "definition",
            Field::Etymology => "etymology",
        }
    }

    fn read<'a>(&self, entry: &'a Entry) -> &'a str {
        match self {
            Field::Headword => &entry.headword,
            Field::Ipa => &entry.ipa,
            Field::Language => &entry.language,
            Field::Definition => &entry.definition,
            Field::Etymology => entry.etymology.as_deref().unwrap_or(""),
        }
    }
}

impl Rule {
    fn check(&self, entry: &Entry) -> Option<String> {
        match self {
            Rule::Required(field) => {
                if field.read(entry).trim().is_empty() {
                    Some(format!("{} is required", field.name()))
                } else {
                    None
                }
            }
            Rule::MaxLen(field, max) => {
                let len = field.read(entry).chars().count();
                if len > *max {
                    Some(format!("{} exceeds {} characters ({len})", field.name(), max))
                } else {
                    None
                }
            }
            Rule::IpaCharset => {
                if entry.ipa.chars().all(is_ipa_char) {
                    None
                } else {
                    Some("ipa contains non-IPA characters".to_string())
                }
            }
            Rule::Iso639 => {
                if KNOWN_LANGUAGE_CODES.contains(&entry.language.as_str()) {
                    None
                } else {
                    Some(format!("unknown language code: {}", entry.language))
                }
            }
        }
    }
}

/// A stateless composition of validation rules.
pub struct EntryValidator {
    rules: Vec<Rule>,
}

impl EntryValidator {
    /// Validator from an explicit rule list.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// The standard rule set applied during ingestion.
    pub fn standard() -> Self {
        Self::new(vec![
            Rule::Required(Field::Headword),
            Rule::Required(Field::Language),
            Rule::Required(Field::Definition),
            Rule::MaxLen(Field::Headword, 255),
            Rule::MaxLen(Field::Ipa, 255),
            Rule::IpaCharset,
            Rule::Iso639,
        ])
    }

    /// Stricter rules requiring pronunciation and etymology.
    pub fn strict() -> Self {
        Self::new(vec![
            Rule::Required(Field::Headword),
            Rule::Required(Field::Ipa),
            Rule::Required(Field::Language),
            Rule::Required(Field::Definition),
            Rule::Required(Field::Etymology),
            Rule::MaxLen(Field::Headword, 255),
            Rule::MaxLen(Field::Ipa, 255),
            Rule::IpaCharset,
            Rule::Iso639,
        ])
    }

    /// Minimal rules for low-quality sources.
    pub fn permissive() -> Self {
        Self::new(vec![
            Rule::Required(Field::Headword),
            Rule::Required(Field::Language),
            Rule::MaxLen(Field::Headword, 255),
        ])
    }

    /// Checks every rule; returns pass/fail plus the failure messages.
    pub fn validate(&self, entry: &Entry) -> (bool, Vec<String>) {
        let errors: Vec<String> = self
            .rules
            .iter()
            .filter_map(|rule| rule.check(entry))
            .collect();
        (errors.is_empty(), errors)
    }
}

/// Quality score derived from validation: 1.0 for clean entries, minus 0.15
/// per failed rule, floored at 0.1.
pub fn quality_score(error_count: usize) -> f64 {
    (1.0 - 0.15 * error_count as f64).max(0.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{entry_id, Entry};

    fn sample_entry() -> Entry {
        Entry {
            id: entry_id("father", "en", "male parent"),
            headword: "father".to_string(),
            ipa: "ˈfɑːðər".to_string(),
            language: "en".to_string(),
            definition: "male parent".to_string(),
            etymology: Some("from Proto-Germanic *fadēr".to_string()),
            pos_tag: Some("noun".to_string()),
            embedding: None,
            raw_checksum: "0".repeat(64),
            source_id: "test".to_string(),
            pipeline_fingerprint: "test:1".to_string(),
            quality: 1.0,
            validation_errors: Vec::new(),
            created_at_epoch_ms: 0,
        }
    }

    #[test]
    fn clean_entry_passes_standard_rules() {
        let (ok, errors) = EntryValidator::standard().validate(&sample_entry());
        assert!(ok, "errors: {errors:?}");
    }

    #[test]
    fn missing_headword_fails() {
        let mut entry = sample_entry();
        entry.headword = "  ".to_string();
        let (ok, errors) = EntryValidator::standard().validate(&entry);
        assert!(!ok);
        assert!(errors.iter().any(|e| e.contains("headword")));
    }

    #[test]
    fn unknown_language_fails_iso_rule() {
        let mut entry = sample_entry();
        entry.language = "xx".to_string();
        let (ok, errors) = EntryValidator::standard().validate(&entry);
        assert!(!ok);
        assert!(errors.iter().any(|e| e.contains("language code")));
    }

    #[test]
    fn bad_ipa_characters_fail() {
        let mut entry = sample_entry();
        entry.ipa = "f@ther!".to_string();
        let (ok, errors) = EntryValidator::standard().validate(&entry);
        assert!(!ok);
        assert!(errors.iter().any(|e| e.contains("IPA")));
    }

    #[test]
    fn strict_requires_etymology() {
        let mut entry = sample_entry();
        entry.etymology = None;
        let (ok, _) = EntryValidator::strict().validate(&entry);
        assert!(!ok);
        let (ok, _) = EntryValidator::standard().validate(&entry);
        assert!(ok);
    }

    #[test]
    fn validator_is_pure() {
        let validator = EntryValidator::standard();
        let entry = sample_entry();
        assert_eq!(validator.validate(&entry), validator.validate(&entry));
    }

    #[test]
    fn quality_score_decreases_with_errors() {
        assert_eq!(quality_score(0), 1.0);
        assert!(quality_score(1) < 1.0);
        assert!(quality_score(10) >= 0.1);
    }
}
