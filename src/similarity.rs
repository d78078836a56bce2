//! Multi-modal similarity composition: semantic + phonetic + etymological.

use crate::entry::Entry;
use crate::phylo::PhyloTable;
use cognate_kernels::{dtw_similarity, grapheme_similarity};
use serde::{Deserialize, Serialize};

/// Recognized weighting intents for similarity queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightPreset {
    /// General-purpose blend.
    Balanced,
    /// Sound-heavy weighting for cognate detection.
    Cognate,
    /// Meaning-heavy weighting for semantic search.
    Semantic,
    /// Ancestry-heavy weighting for historical queries.
    Historical,
}

impl WeightPreset {
    /// Parses a preset name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "balanced" => Some(Self::Balanced),
            "cognate" => Some(Self::Cognate),
            "semantic" => Some(Self::Semantic),
            "historical" => Some(Self::Historical),
            _ => None,
        }
    }

    /// The component weights for this preset. Each set sums to 1.
    pub fn weights(&self) -> SimilarityWeights {
        match self {
            Self::Balanced => SimilarityWeights::new(0.4, 0.4, 0.2),
            Self::Cognate => SimilarityWeights::new(0.3, 0.6, 0.1),
            Self::Semantic => SimilarityWeights::new(0.7, 0.2, 0.1),
            Self::Historical => SimilarityWeights::new(0.1, 0.4, 0.5),
        }
    }
}

/// Component weights used to combine similarity layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWeights {
    /// Weight on embedding cosine similarity.
    pub semantic: f64,
    /// Weight on phonetic alignment similarity.
    pub phonetic: f64,
    /// Weight on the phylogenetic cognate prior.
    pub etymological: f64,
}

impl SimilarityWeights {
    /// Builds a weight set.
    pub fn new(semantic: f64, phonetic: f64, etymological: f64) -> Self {
        Self {
            semantic,
            phonetic,
            etymological,
        }
    }

    /// Sum of the three weights.
    pub fn sum(&self) -> f64 {
        self.semantic + self.phonetic + self.etymological
    }

    /// Drops the etymological component and rescales the rest to sum to 1.
    /// Used when no phylogenetic prior is available for a pair.
    pub fn without_etymology(&self) -> Self {
        let remaining = self.semantic + self.phonetic;
        if remaining <= 0.0 {
            return Self::new(0.5, 0.5, 0.0);
        }
        Self::new(self.semantic / remaining, self.phonetic / remaining, 0.0)
    }
}

/// A composed similarity edge between two entries, canonicalized so that
/// `entry_a < entry_b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    /// Lexicographically smaller entry id.
    pub entry_a: String,
    /// Lexicographically larger entry id.
    pub entry_b: String,
    /// Embedding cosine similarity, clamped to `[0, 1]`.
    pub semantic: f64,
    /// Phonetic alignment similarity in `[0, 1]`.
    pub phonetic: f64,
    /// Phylogenetic cognate prior in `[0, 1]` (0 when unavailable).
    pub etymological: f64,
    /// Weighted combination in `[0, 1]`.
    pub combined: f64,
    /// The weights actually applied (renormalized when the prior is absent).
    pub weights: SimilarityWeights,
    /// Tree distance between the two languages, when known.
    pub phylo_distance: Option<u32>,
}

/// Composes the multi-modal similarity between two entries.
///
/// Semantic similarity needs both embeddings present and otherwise reads 0.
/// Phonetic similarity aligns IPA when both sides carry a transcription and
/// falls back to grapheme similarity over the headwords. A missing
/// phylogenetic pair zeroes the etymological weight and renormalizes.
pub fn compose(
    entry_a: &Entry,
    entry_b: &Entry,
    preset: WeightPreset,
    phylo: &PhyloTable,
) -> SimilarityEdge {
    let (first, second) = if entry_a.id <= entry_b.id {
        (entry_a, entry_b)
    } else {
        (entry_b, entry_a)
    };

    let semantic = match (&first.embedding, &second.embedding) {
        (Some(a), Some(b)) => (crate::store::cosine(a, b) as f64).clamp(0.0, 1.0),
        _ => 0.0,
    };

    let phonetic = if !first.ipa.is_empty() && !second.ipa.is_empty() {
        dtw_similarity(&first.ipa, &second.ipa)
    } else {
        grapheme_similarity(&first.headword, &second.headword)
    };

    let looked_up = phylo.lookup(&first.language, &second.language);
    let (weights, etymological, phylo_distance) = match looked_up {
        Some(entry) => (preset.weights(), entry.prior, Some(entry.tree_distance)),
        None => (preset.weights().without_etymology(), 0.0, None),
    };

    let combined = (weights.semantic * semantic
        + weights.phonetic * phonetic
        + weights.etymological * etymological)
        .clamp(0.0, 1.0);

    SimilarityEdge {
        entry_a: first.id.clone(),
        entry_b: second.id.clone(),
        semantic,
        phonetic,
        etymological,
        combined,
        weights,
        phylo_distance,
    }
}

/// Composes every pairwise edge over an entry set, keeping those whose
/// combined score meets `min_combined`.
pub fn pairwise_edges(
    entries: &[Entry],
    preset: WeightPreset,
    phylo: &PhyloTable,
    min_combined: f64,
) -> Vec<SimilarityEdge> {
    use rayon::prelude::*;

    let pairs: Vec<(usize, usize)> = (0..entries.len())
        .flat_map(|i| (i + 1..entries.len()).map(move |j| (i, j)))
        .collect();

    pairs
        .par_iter()
        .map(|&(i, j)| compose(&entries[i], &entries[j], preset, phylo))
        .filter(|edge| edge.combined >= min_combined)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::entry_id;

    fn entry(headword: &str, ipa: &str, language: &str, embedding: Option<Vec<f32>>) -> Entry {
        Entry {
            id: entry_id(headword, language, "gloss"),
            headword: headword.to_string(),
            ipa: ipa.to_string(),
            language: language.to_string(),
            definition: "gloss".to_string(),
            etymology: None,
            pos_tag: None,
            embedding,
            raw_checksum: "0".repeat(64),
            source_id: "test".to_string(),
            pipeline_fingerprint: "fp".to_string(),
            quality: 1.0,
            validation_errors: Vec::new(),
            created_at_epoch_ms: 0,
        }
    }

    #[test]
    fn preset_weights_sum_to_one() {
        for preset in [
            WeightPreset::Balanced,
            WeightPreset::Cognate,
            WeightPreset::Semantic,
            WeightPreset::Historical,
        ] {
            let sum = preset.weights().sum();
            assert!((sum - 1.0).abs() < 1e-9, "{preset:?} sums to {sum}");
        }
    }

    #[test]
    fn preset_names_parse() {
        assert_eq!(WeightPreset::parse("cognate"), Some(WeightPreset::Cognate));
        assert_eq!(WeightPreset::parse("BALANCED"), Some(WeightPreset::Balanced));
        assert_eq!(WeightPreset::parse("other"), None);
    }

    #[test]
    fn edges_are_canonically_ordered() {
        let mut phylo = PhyloTable::empty();
        phylo.insert("en", "de", 2, 0.6);
        let a = entry("father", "ˈfɑːðər", "en", Some(vec![1.0, 0.0]));
        let b = entry("vater", "ˈfaːtɐ", "de", Some(vec![0.9, 0.1]));

        let forward = compose(&a, &b, WeightPreset::Cognate, &phylo);
        let backward = compose(&b, &a, WeightPreset::Cognate, &phylo);
        assert_eq!(forward, backward);
        assert!(forward.entry_a < forward.entry_b);
    }

    #[test]
    fn combined_stays_in_unit_interval() {
        let mut phylo = PhyloTable::empty();
        phylo.insert("en", "de", 2, 0.6);
        let a = entry("father", "ˈfɑːðər", "en", Some(vec![1.0, 0.0]));
        let b = entry("vater", "ˈfaːtɐ", "de", Some(vec![1.0, 0.0]));
        let edge = compose(&a, &b, WeightPreset::Balanced, &phylo);
        assert!(edge.combined >= 0.0 && edge.combined <= 1.0);
        assert!(edge.semantic > 0.9);
        assert!(edge.phonetic > 0.5);
        assert_eq!(edge.phylo_distance, Some(2));
    }

    #[test]
    fn missing_prior_renormalizes_weights() {
        let a = entry("viz", "viz", "hu", Some(vec![1.0, 0.0]));
        let b = entry("water", "ˈwɔːtər", "en", Some(vec![1.0, 0.0]));
        let edge = compose(&a, &b, WeightPreset::Balanced, &PhyloTable::empty());
        assert_eq!(edge.etymological, 0.0);
        assert_eq!(edge.weights.etymological, 0.0);
        assert!((edge.weights.sum() - 1.0).abs() < 1e-9);
        assert!(edge.phylo_distance.is_none());
    }

    #[test]
    fn grapheme_fallback_when_ipa_missing() {
        let a = entry("pater", "", "la", None);
        let b = entry("patere", "", "la", None);
        let edge = compose(&a, &b, WeightPreset::Cognate, &PhyloTable::empty());
        assert!(edge.phonetic > 0.7);
        assert_eq!(edge.semantic, 0.0);
    }

    #[test]
    fn pairwise_filters_by_combined_score() {
        let phylo = PhyloTable::empty();
        let entries = vec![
            entry("father", "ˈfɑːðər", "en", None),
            entry("vater", "ˈfaːtɐ", "de", None),
            entry("okno", "ˈɔknɔ", "pl", None),
        ];
        let edges = pairwise_edges(&entries, WeightPreset::Cognate, &phylo, 0.5);
        assert!(edges
            .iter()
            .all(|edge| edge.combined >= 0.5 && edge.entry_a < edge.entry_b));
        assert!(edges.len() < 3);
    }
}
