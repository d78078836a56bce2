//! Composable, versioned cleaning transformations over entry fields.
//!
//! Each cleaner is a pure `&str -> String` function with a matching
//! validation predicate. Versions participate in the pipeline fingerprint,
//! so bumping one reprocesses the affected entries.

use unicode_normalization::UnicodeNormalization;

/// A pure, versioned, deterministic field transformation.
pub trait Cleaner: Send + Sync {
    /// Stable cleaner name used in fingerprints and transform logs.
    fn name(&self) -> &'static str;
    /// Semantic version of the transformation.
    fn version(&self) -> &'static str;
    /// Applies the transformation. Must be pure.
    fn clean(&self, input: &str) -> String;
    /// Whether the cleaned value is acceptable.
    fn validate(&self, cleaned: &str) -> bool;
}

/// Strips dictionary markup from headwords: reconstruction asterisks,
/// dagger/section markers, parentheticals, and angle/square brackets.
pub struct HeadwordStripper;

impl Cleaner for HeadwordStripper {
    fn name(&self) -> &'static str {
        "headword_stripper"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn clean(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut paren_depth = 0usize;
        for ch in input.chars() {
            match ch {
                '(' => paren_depth += 1,
                ')' => paren_depth = paren_depth.saturating_sub(1),
                _ if paren_depth > 0 => {}
                '*' | '†' | '‡' | '§' | '¶' | '[' | ']' | '⟨' | '⟩' | 'ˀ' => {}
                _ => out.push(ch),
            }
        }
        collapse_whitespace(&nfc(&out))
    }

    fn validate(&self, cleaned: &str) -> bool {
        !cleaned.trim().is_empty()
    }
}

/// Unicode NFC plus whitespace collapsing, with optional casefolding.
pub struct TextNormalizer {
    casefold: bool,
}

impl TextNormalizer {
    /// Normalizer that preserves case.
    pub fn new() -> Self {
        Self { casefold: false }
    }

    /// Normalizer that additionally lowercases.
    pub fn casefolding() -> Self {
        Self { casefold: true }
    }
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Cleaner for TextNormalizer {
    fn name(&self) -> &'static str {
        "text_normalizer"
    }

    fn version(&self) -> &'static str {
        "1.1.0"
    }

    fn clean(&self, input: &str) -> String {
        let normalized = nfc(input);
        let collapsed = collapse_whitespace(&normalized);
        if self.casefold {
            collapsed.to_lowercase()
        } else {
            collapsed
        }
    }

    fn validate(&self, cleaned: &str) -> bool {
        !cleaned.trim().is_empty()
    }
}

/// Normalizes IPA transcriptions: strips enclosing brackets and slashes,
/// keeps diacritics, applies NFC. Validation checks the character whitelist.
pub struct IpaNormalizer;

impl Cleaner for IpaNormalizer {
    fn name(&self) -> &'static str {
        "ipa_normalizer"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn clean(&self, input: &str) -> String {
        let stripped: String = input
            .chars()
            .filter(|ch| !matches!(ch, '[' | ']' | '/' | '⟨' | '⟩'))
            .collect();
        collapse_whitespace(&nfc(&stripped))
    }

    fn validate(&self, cleaned: &str) -> bool {
        !cleaned.is_empty() && cleaned.chars().all(is_ipa_char)
    }
}

/// Maps language names and 3-letter codes onto canonical ISO-639 codes.
pub struct LanguageCodeCanonicalizer;

/// Full-name and legacy-code aliases for languages this corpus carries.
const LANGUAGE_ALIASES: &[(&str, &str)] = &[
    ("english", "en"),
    ("german", "de"),
    ("dutch", "nl"),
    ("french", "fr"),
    ("spanish", "es"),
    ("italian", "it"),
    ("portuguese", "pt"),
    ("romanian", "ro"),
    ("latin", "la"),
    ("greek", "el"),
    ("ancient greek", "grc"),
    ("russian", "ru"),
    ("ukrainian", "uk"),
    ("polish", "pl"),
    ("czech", "cs"),
    ("lithuanian", "lt"),
    ("latvian", "lv"),
    ("sanskrit", "sa"),
    ("hindi", "hi"),
    ("persian", "fa"),
    ("swedish", "sv"),
    ("norwegian", "no"),
    ("danish", "da"),
    ("icelandic", "is"),
    ("irish", "ga"),
    ("welsh", "cy"),
    ("armenian", "hy"),
    ("albanian", "sq"),
    ("proto-indo-european", "pie"),
    ("deu", "de"),
    ("eng", "en"),
    ("fra", "fr"),
    ("lat", "la"),
    ("nld", "nl"),
    ("rus", "ru"),
    ("spa", "es"),
];

impl Cleaner for LanguageCodeCanonicalizer {
    fn name(&self) -> &'static str {
        "language_code_canonicalizer"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn clean(&self, input: &str) -> String {
        let lowered = input.trim().to_lowercase();
        for (alias, code) in LANGUAGE_ALIASES {
            if *alias == lowered {
                return (*code).to_string();
            }
        }
        lowered
    }

    fn validate(&self, cleaned: &str) -> bool {
        (2..=3).contains(&cleaned.len()) && cleaned.chars().all(|ch| ch.is_ascii_lowercase())
    }
}

/// Cleans definitions: removes HTML tags and `[n]` citation markers,
/// collapses whitespace, optionally truncates at a word boundary.
pub struct DefinitionCleaner {
    max_length: Option<usize>,
}

impl DefinitionCleaner {
    /// Cleaner without a length cap.
    pub fn new() -> Self {
        Self { max_length: None }
    }

    /// Cleaner that truncates cleaned text beyond `max_length` characters.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: Some(max_length),
        }
    }
}

impl Default for DefinitionCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl Cleaner for DefinitionCleaner {
    fn name(&self) -> &'static str {
        "definition_cleaner"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn clean(&self, input: &str) -> String {
        let without_markup = strip_markup(input);
        let mut cleaned = collapse_whitespace(&nfc(&without_markup));
        if let Some(max) = self.max_length {
            if cleaned.chars().count() > max {
                cleaned = truncate_at_word(&cleaned, max);
            }
        }
        cleaned
    }

    fn validate(&self, cleaned: &str) -> bool {
        cleaned.trim().chars().count() >= 3
    }
}

/// Removes `<...>` tag spans and `[digits]` citation markers.
fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '<' => {
                for next in chars.by_ref() {
                    if next == '>' {
                        break;
                    }
                }
                // A removed tag still separates words.
                out.push(' ');
            }
            '[' => {
                let mut lookahead = chars.clone();
                let mut digits = 0usize;
                let mut closed = false;
                for next in lookahead.by_ref() {
                    if next.is_ascii_digit() {
                        digits += 1;
                    } else {
                        closed = next == ']';
                        break;
                    }
                }
                if digits > 0 && closed {
                    for next in chars.by_ref() {
                        if next == ']' {
                            break;
                        }
                    }
                } else {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

fn truncate_at_word(input: &str, max_chars: usize) -> String {
    let mut cut = String::with_capacity(max_chars);
    for ch in input.chars().take(max_chars) {
        cut.push(ch);
    }
    match cut.rfind(' ') {
        Some(idx) if idx > 0 => format!("{}...", &cut[..idx]),
        _ => format!("{cut}..."),
    }
}

/// NFC-normalizes a string.
pub fn nfc(input: &str) -> String {
    input.nfc().collect()
}

/// Collapses runs of whitespace into single spaces and trims the ends.
pub fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

/// Whether a character is acceptable inside a normalized IPA transcription.
pub fn is_ipa_char(ch: char) -> bool {
    matches!(ch,
        'a'..='z'
        | '\u{00C0}'..='\u{024F}' // composed Latin letters (ã, ø, æ, ç, ...)
        | '\u{0250}'..='\u{02AF}' // IPA extensions
        | '\u{02B0}'..='\u{02FF}' // spacing modifiers (stress, length, aspiration)
        | '\u{0300}'..='\u{036F}' // combining diacritics
        | '\u{1D00}'..='\u{1D7F}' // phonetic extensions
        | 'θ' | 'β' | 'χ'
        | 'ⁿ' | '‿' | '.' | ' ' | '|' | '\u{2016}'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headword_stripper_removes_markers() {
        let cleaner = HeadwordStripper;
        assert_eq!(cleaner.clean("*wódr̥"), "wódr̥");
        assert_eq!(cleaner.clean("father† (obs.)"), "father");
        assert_eq!(cleaner.clean("[brac]keted"), "bracketed");
        assert!(cleaner.validate("father"));
        assert!(!cleaner.validate("   "));
    }

    #[test]
    fn headword_stripper_is_pure() {
        let cleaner = HeadwordStripper;
        assert_eq!(cleaner.clean("*wódr̥"), cleaner.clean("*wódr̥"));
    }

    #[test]
    fn text_normalizer_collapses_and_folds() {
        let plain = TextNormalizer::new();
        assert_eq!(plain.clean("  Male   Parent "), "Male Parent");
        let folding = TextNormalizer::casefolding();
        assert_eq!(folding.clean("  Male   Parent "), "male parent");
    }

    #[test]
    fn text_normalizer_applies_nfc() {
        let plain = TextNormalizer::new();
        // e + combining acute composes to é.
        assert_eq!(plain.clean("cafe\u{301}"), "caf\u{e9}");
    }

    #[test]
    fn ipa_normalizer_strips_brackets_keeps_diacritics() {
        let cleaner = IpaNormalizer;
        assert_eq!(cleaner.clean("[ˈfɑːðə(r)]"), "ˈfɑːðə(r)");
        assert_eq!(cleaner.clean("/ˈvaːtɐ/"), "ˈvaːtɐ");
        assert!(cleaner.validate("ˈfɑːðər"));
        assert!(!cleaner.validate("f@ther"));
        assert!(!cleaner.validate(""));
    }

    #[test]
    fn language_codes_canonicalize() {
        let cleaner = LanguageCodeCanonicalizer;
        assert_eq!(cleaner.clean("English"), "en");
        assert_eq!(cleaner.clean("deu"), "de");
        assert_eq!(cleaner.clean("Ancient Greek"), "grc");
        assert_eq!(cleaner.clean("la"), "la");
        assert!(cleaner.validate("en"));
        assert!(cleaner.validate("grc"));
        assert!(!cleaner.validate("q"));
        assert!(!cleaner.validate("engl"));
    }

    #[test]
    fn definition_cleaner_strips_html_and_citations() {
        let cleaner = DefinitionCleaner::new();
        assert_eq!(
            cleaner.clean("a <b>male</b> parent[1][23]"),
            "a male parent"
        );
        assert_eq!(cleaner.clean("keep [sic] brackets"), "keep [sic] brackets");
        assert!(cleaner.validate("male parent"));
        assert!(!cleaner.validate("ab"));
    }

    #[test]
    fn definition_cleaner_truncates_at_word_boundary() {
        let cleaner = DefinitionCleaner::with_max_length(12);
        let cleaned = cleaner.clean("a very long definition that keeps going");
        assert!(cleaned.ends_with("..."));
        assert!(cleaned.chars().count() <= 16);
    }

    #[test]
    fn ipa_charset_accepts_common_transcriptions() {
        for ipa in ["ˈfɑːðər", "ˈvaːtɐ", "ˈpa.ter", "mãw̃"] {
            assert!(ipa.chars().all(is_ipa_char), "rejected {ipa}");
        }
        assert!(!is_ipa_char('@'));
        assert!(!is_ipa_char('!'));
    }
}
