//! Feature-weighted phonetic distance over IPA strings.
//!
//! IPA strings are segmented into grapheme clusters, each mapped onto a
//! fixed-length articulatory feature vector. Distance between two strings is
//! dynamic time warping with a weighted-L1 local cost and a fixed gap cost.

use rayon::prelude::*;
use unicode_segmentation::UnicodeSegmentation;

/// Number of articulatory feature dimensions per segment.
pub const FEATURE_DIM: usize = 8;

const PLACE: usize = 0;
const MANNER: usize = 1;
const VOICE: usize = 2;
const HEIGHT: usize = 3;
const BACKNESS: usize = 4;
const ROUNDING: usize = 5;
const NASALITY: usize = 6;
const LENGTH: usize = 7;

/// Per-dimension weights applied to the L1 feature delta.
const FEATURE_WEIGHTS: [f64; FEATURE_DIM] = [0.9, 1.0, 0.4, 1.0, 0.7, 0.3, 0.6, 0.3];

/// Cost of aligning a segment against a gap.
const GAP_COST: f64 = 1.0;

/// Substitution cost charged when either segment has no known feature vector.
const WILDCARD_PENALTY: f64 = 0.35;

/// One phoneme-sized unit of an IPA string.
#[derive(Debug, Clone, PartialEq)]
pub struct IpaSegment {
    /// The grapheme cluster as written.
    pub grapheme: String,
    /// Articulatory feature vector; meaningful only when `known`.
    pub features: [f64; FEATURE_DIM],
    /// False when the grapheme is outside the feature table.
    pub known: bool,
}

impl IpaSegment {
    fn substitution_cost(&self, other: &IpaSegment) -> f64 {
        if self.grapheme == other.grapheme {
            return 0.0;
        }
        if !self.known || !other.known {
            return WILDCARD_PENALTY;
        }
        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for i in 0..FEATURE_DIM {
            weighted += FEATURE_WEIGHTS[i] * (self.features[i] - other.features[i]).abs();
            weight_sum += FEATURE_WEIGHTS[i];
        }
        weighted / weight_sum
    }
}

/// Segments an IPA string into feature-tagged phoneme units.
///
/// Stress marks and syllable separators are dropped; length marks and a
/// trailing combining tilde fold into the preceding segment.
pub fn segment_ipa(ipa: &str) -> Vec<IpaSegment> {
    let mut segments: Vec<IpaSegment> = Vec::new();
    for grapheme in ipa.graphemes(true) {
        let Some(base) = grapheme.chars().next() else {
            continue;
        };
        if is_ignored_mark(base) {
            continue;
        }
        if is_length_mark(base) {
            if let Some(last) = segments.last_mut() {
                last.features[LENGTH] = 1.0;
                last.grapheme.push_str(grapheme);
            }
            continue;
        }
        let mut segment = match feature_vector(base) {
            Some(features) => IpaSegment {
                grapheme: grapheme.to_string(),
                features,
                known: true,
            },
            None => IpaSegment {
                grapheme: grapheme.to_string(),
                features: [0.0; FEATURE_DIM],
                known: false,
            },
        };
        // Combining tilde marks nasalization on the carrier.
        if grapheme.chars().any(|ch| ch == '\u{0303}') {
            segment.features[NASALITY] = 1.0;
        }
        segments.push(segment);
    }
    segments
}

/// DTW cost between two IPA strings. Zero for identical inputs; symmetric.
pub fn dtw_distance(ipa_a: &str, ipa_b: &str) -> f64 {
    let a = segment_ipa(ipa_a);
    let b = segment_ipa(ipa_b);
    dtw_cost(&a, &b)
}

/// Normalized DTW similarity in `[0, 1]`.
pub fn dtw_similarity(ipa_a: &str, ipa_b: &str) -> f64 {
    let a = segment_ipa(ipa_a);
    let b = segment_ipa(ipa_b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let max_cost = GAP_COST * a.len().max(b.len()) as f64;
    let similarity = 1.0 - dtw_cost(&a, &b) / max_cost;
    similarity.clamp(0.0, 1.0)
}

fn dtw_cost(a: &[IpaSegment], b: &[IpaSegment]) -> f64 {
    if a.is_empty() {
        return GAP_COST * b.len() as f64;
    }
    if b.is_empty() {
        return GAP_COST * a.len() as f64;
    }

    let width = b.len() + 1;
    let mut prev: Vec<f64> = (0..width).map(|j| GAP_COST * j as f64).collect();
    let mut curr = vec![0.0f64; width];

    for (i, seg_a) in a.iter().enumerate() {
        curr[0] = GAP_COST * (i + 1) as f64;
        for (j, seg_b) in b.iter().enumerate() {
            let substitute = prev[j] + seg_a.substitution_cost(seg_b);
            let delete = prev[j + 1] + GAP_COST;
            let insert = curr[j] + GAP_COST;
            curr[j + 1] = substitute.min(delete).min(insert);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Plain grapheme-level similarity (Levenshtein ratio), for orthographic
/// forms without a usable IPA transcription.
pub fn grapheme_similarity(a: &str, b: &str) -> f64 {
    let seg_a: Vec<&str> = a.graphemes(true).collect();
    let seg_b: Vec<&str> = b.graphemes(true).collect();
    let max_len = seg_a.len().max(seg_b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&seg_a, &seg_b) as f64 / max_len as f64
}

fn levenshtein(a: &[&str], b: &[&str]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, seg_a) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, seg_b) in b.iter().enumerate() {
            let cost = usize::from(seg_a != seg_b);
            curr[j + 1] = (curr[j] + 1).min(prev[j + 1] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Computes DTW similarity for many pairs in parallel.
pub fn batch_similarity(pairs: &[(String, String)]) -> Vec<f64> {
    pairs
        .par_iter()
        .map(|(a, b)| dtw_similarity(a, b))
        .collect()
}

fn is_ignored_mark(ch: char) -> bool {
    matches!(
        ch,
        'ˈ' | 'ˌ' | '.' | ' ' | '\t' | '‿' | 'ʰ' | 'ʲ' | 'ʷ' | 'ˠ' | 'ˤ'
    )
}

fn is_length_mark(ch: char) -> bool {
    matches!(ch, 'ː' | 'ˑ' | '\u{0306}')
}

/// Articulatory feature vector for a single IPA base character.
///
/// Consonants use place/manner/voice/nasality; vowels use height/backness/
/// rounding with manner pinned to 1.0 so vowel-consonant substitutions stay
/// expensive. Values are scaled positions along each articulatory axis.
fn feature_vector(ch: char) -> Option<[f64; FEATURE_DIM]> {
    let mut f = [0.0f64; FEATURE_DIM];
    match ch {
        // Stops.
        'p' => consonant(&mut f, 0.0, 0.0, 0.0),
        'b' => consonant(&mut f, 0.0, 0.0, 1.0),
        't' => consonant(&mut f, 0.3, 0.0, 0.0),
        'd' => consonant(&mut f, 0.3, 0.0, 1.0),
        'ʈ' => consonant(&mut f, 0.5, 0.0, 0.0),
        'ɖ' => consonant(&mut f, 0.5, 0.0, 1.0),
        'c' => consonant(&mut f, 0.65, 0.0, 0.0),
        'ɟ' => consonant(&mut f, 0.65, 0.0, 1.0),
        'k' => consonant(&mut f, 0.8, 0.0, 0.0),
        'g' | 'ɡ' => consonant(&mut f, 0.8, 0.0, 1.0),
        'q' => consonant(&mut f, 0.9, 0.0, 0.0),
        'ɢ' => consonant(&mut f, 0.9, 0.0, 1.0),
        'ʔ' => consonant(&mut f, 1.0, 0.0, 0.0),
        // Nasals.
        'm' => nasal(&mut f, 0.0),
        'ɱ' => nasal(&mut f, 0.1),
        'n' => nasal(&mut f, 0.3),
        'ɳ' => nasal(&mut f, 0.5),
        'ɲ' => nasal(&mut f, 0.65),
        'ŋ' => nasal(&mut f, 0.8),
        'ɴ' => nasal(&mut f, 0.9),
        // Trills and taps.
        'ʙ' => consonant(&mut f, 0.0, 0.6, 1.0),
        'r' => consonant(&mut f, 0.3, 0.6, 1.0),
        'ʀ' => consonant(&mut f, 0.9, 0.6, 1.0),
        'ɾ' => consonant(&mut f, 0.3, 0.65, 1.0),
        'ɽ' => consonant(&mut f, 0.5, 0.65, 1.0),
        // Fricatives.
        'ɸ' => consonant(&mut f, 0.0, 0.3, 0.0),
        'β' => consonant(&mut f, 0.0, 0.3, 1.0),
        'f' => consonant(&mut f, 0.1, 0.3, 0.0),
        'v' => consonant(&mut f, 0.1, 0.3, 1.0),
        'θ' => consonant(&mut f, 0.2, 0.3, 0.0),
        'ð' => consonant(&mut f, 0.2, 0.3, 1.0),
        's' => consonant(&mut f, 0.3, 0.3, 0.0),
        'z' => consonant(&mut f, 0.3, 0.3, 1.0),
        'ʃ' => consonant(&mut f, 0.4, 0.3, 0.0),
        'ʒ' => consonant(&mut f, 0.4, 0.3, 1.0),
        'ʂ' => consonant(&mut f, 0.5, 0.3, 0.0),
        'ʐ' => consonant(&mut f, 0.5, 0.3, 1.0),
        'ç' => consonant(&mut f, 0.65, 0.3, 0.0),
        'ʝ' => consonant(&mut f, 0.65, 0.3, 1.0),
        'x' => consonant(&mut f, 0.8, 0.3, 0.0),
        'ɣ' => consonant(&mut f, 0.8, 0.3, 1.0),
        'χ' => consonant(&mut f, 0.9, 0.3, 0.0),
        'ʁ' => consonant(&mut f, 0.9, 0.3, 1.0),
        'ħ' => consonant(&mut f, 0.95, 0.3, 0.0),
        'ʕ' => consonant(&mut f, 0.95, 0.3, 1.0),
        'h' => consonant(&mut f, 1.0, 0.3, 0.0),
        'ɦ' => consonant(&mut f, 1.0, 0.3, 1.0),
        // Affricates.
        'ʦ' => consonant(&mut f, 0.3, 0.2, 0.0),
        'ʣ' => consonant(&mut f, 0.3, 0.2, 1.0),
        'ʧ' => consonant(&mut f, 0.4, 0.2, 0.0),
        'ʤ' => consonant(&mut f, 0.4, 0.2, 1.0),
        // Approximants and laterals.
        'ʋ' => consonant(&mut f, 0.1, 0.8, 1.0),
        'ɹ' => consonant(&mut f, 0.3, 0.8, 1.0),
        'ɻ' => consonant(&mut f, 0.5, 0.8, 1.0),
        'j' => consonant(&mut f, 0.65, 0.8, 1.0),
        'ɰ' => consonant(&mut f, 0.8, 0.8, 1.0),
        'w' => consonant(&mut f, 0.8, 0.8, 1.0),
        'l' => consonant(&mut f, 0.3, 0.85, 1.0),
        'ɭ' => consonant(&mut f, 0.5, 0.85, 1.0),
        'ʎ' => consonant(&mut f, 0.65, 0.85, 1.0),
        'ʟ' => consonant(&mut f, 0.8, 0.85, 1.0),
        // Vowels.
        'i' => vowel(&mut f, 1.0, 0.0, 0.0),
        'y' => vowel(&mut f, 1.0, 0.0, 1.0),
        'ɨ' => vowel(&mut f, 1.0, 0.5, 0.0),
        'ʉ' => vowel(&mut f, 1.0, 0.5, 1.0),
        'ɯ' => vowel(&mut f, 1.0, 1.0, 0.0),
        'u' => vowel(&mut f, 1.0, 1.0, 1.0),
        'ɪ' => vowel(&mut f, 0.85, 0.15, 0.0),
        'ʏ' => vowel(&mut f, 0.85, 0.15, 1.0),
        'ʊ' => vowel(&mut f, 0.85, 0.85, 1.0),
        'e' => vowel(&mut f, 0.75, 0.0, 0.0),
        'ø' => vowel(&mut f, 0.75, 0.0, 1.0),
        'ɘ' => vowel(&mut f, 0.75, 0.5, 0.0),
        'ɵ' => vowel(&mut f, 0.75, 0.5, 1.0),
        'ɤ' => vowel(&mut f, 0.75, 1.0, 0.0),
        'o' => vowel(&mut f, 0.75, 1.0, 1.0),
        'ə' => vowel(&mut f, 0.5, 0.5, 0.0),
        'ɛ' => vowel(&mut f, 0.25, 0.0, 0.0),
        'œ' => vowel(&mut f, 0.25, 0.0, 1.0),
        'ɜ' => vowel(&mut f, 0.25, 0.5, 0.0),
        'ɞ' => vowel(&mut f, 0.25, 0.5, 1.0),
        'ʌ' => vowel(&mut f, 0.25, 1.0, 0.0),
        'ɔ' => vowel(&mut f, 0.25, 1.0, 1.0),
        'æ' => vowel(&mut f, 0.15, 0.0, 0.0),
        'ɐ' => vowel(&mut f, 0.15, 0.5, 0.0),
        'a' => vowel(&mut f, 0.0, 0.0, 0.0),
        'ɶ' => vowel(&mut f, 0.0, 0.0, 1.0),
        'ɑ' => vowel(&mut f, 0.0, 1.0, 0.0),
        'ɒ' => vowel(&mut f, 0.0, 1.0, 1.0),
        _ => return None,
    }
    Some(f)
}

fn consonant(f: &mut [f64; FEATURE_DIM], place: f64, manner: f64, voice: f64) {
    f[PLACE] = place;
    f[MANNER] = manner;
    f[VOICE] = voice;
}

fn nasal(f: &mut [f64; FEATURE_DIM], place: f64) {
    f[PLACE] = place;
    f[MANNER] = 0.5;
    f[VOICE] = 1.0;
    f[NASALITY] = 1.0;
}

fn vowel(f: &mut [f64; FEATURE_DIM], height: f64, backness: f64, rounding: f64) {
    f[MANNER] = 1.0;
    f[VOICE] = 1.0;
    f[HEIGHT] = height;
    f[BACKNESS] = backness;
    f[ROUNDING] = rounding;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_cost_zero() {
        assert_eq!(dtw_distance("pater", "pater"), 0.0);
        assert_eq!(dtw_similarity("pater", "pater"), 1.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let forward = dtw_distance("pater", "pitar");
        let backward = dtw_distance("pitar", "pater");
        assert_eq!(forward, backward);
    }

    #[test]
    fn related_forms_score_high() {
        let similarity = dtw_similarity("pater", "pitar");
        assert!(similarity > 0.6, "got {similarity}");
        assert!(similarity < 1.0);
    }

    #[test]
    fn unrelated_forms_score_lower() {
        let related = dtw_similarity("fatər", "fater");
        let unrelated = dtw_similarity("fatər", "okno");
        assert!(related > unrelated);
    }

    #[test]
    fn empty_vs_nonempty_scores_zero() {
        assert_eq!(dtw_similarity("", ""), 1.0);
        assert_eq!(dtw_similarity("", "abc"), 0.0);
    }

    #[test]
    fn length_mark_folds_into_previous_segment() {
        let segments = segment_ipa("aːt");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].grapheme, "aː");
        assert_eq!(segments[0].features[LENGTH], 1.0);
    }

    #[test]
    fn stress_marks_are_dropped() {
        let plain = segment_ipa("fɑðər");
        let stressed = segment_ipa("ˈfɑðər");
        assert_eq!(plain.len(), stressed.len());
        assert_eq!(dtw_distance("ˈfɑðər", "fɑðər"), 0.0);
    }

    #[test]
    fn unknown_phonemes_use_wildcard_penalty() {
        // '%' is not in the feature table; substitution against anything
        // costs the wildcard penalty rather than a full gap.
        let cost = dtw_distance("%", "p");
        assert_eq!(cost, WILDCARD_PENALTY);
        assert_eq!(dtw_distance("%", "%"), 0.0);
    }

    #[test]
    fn batch_matches_sequential() {
        let pairs = vec![
            ("pater".to_string(), "pitar".to_string()),
            ("mater".to_string(), "mutter".to_string()),
            ("aqua".to_string(), "eau".to_string()),
        ];
        let batch = batch_similarity(&pairs);
        for (pair, got) in pairs.iter().zip(&batch) {
            assert_eq!(*got, dtw_similarity(&pair.0, &pair.1));
        }
    }

    #[test]
    fn grapheme_similarity_handles_plain_orthography() {
        assert_eq!(grapheme_similarity("test", "test"), 1.0);
        let ratio = grapheme_similarity("abcd", "acd");
        assert!(ratio > 0.7);
        assert_eq!(grapheme_similarity("", ""), 1.0);
    }
}
