//! Cognate set detection over composed similarity edges.

use crate::entry::Entry;
use crate::phylo::PhyloTable;
use crate::similarity::{pairwise_edges, SimilarityEdge, WeightPreset};
use cognate_kernels::SimilarityGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A detected cognate set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CognateCluster {
    /// Canonical cluster id (ascending by smallest member id).
    pub cluster_id: usize,
    /// Dominant concept among the members, when assignments are known.
    pub concept_id: Option<String>,
    /// Member entry ids, sorted.
    pub members: Vec<String>,
    /// Languages represented, sorted.
    pub languages: Vec<String>,
    /// Lexicographically smallest member id.
    pub representative: String,
    /// Mean combined similarity over the cluster's retained edges.
    pub confidence: f64,
    /// Number of members.
    pub size: usize,
}

/// Tuning for cognate detection.
#[derive(Debug, Clone)]
pub struct CognateParams {
    /// Minimum combined similarity for an edge to enter the graph.
    pub threshold: f64,
    /// Weighting intent used when composing edges.
    pub preset: WeightPreset,
}

impl Default for CognateParams {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            preset: WeightPreset::Cognate,
        }
    }
}

/// Detects cognate sets: composes pairwise similarity edges, thresholds
/// them into a graph, and reads off connected components. Deterministic
/// given the same entries and parameters.
pub fn detect_cognates(
    entries: &[Entry],
    params: &CognateParams,
    phylo: &PhyloTable,
    concept_assignments: &HashMap<String, (String, f64)>,
) -> Vec<CognateCluster> {
    let edges = pairwise_edges(entries, params.preset, phylo, params.threshold);
    clusters_from_edges(entries, &edges, params.threshold, concept_assignments)
}

/// Builds cognate clusters from precomputed edges (e.g. read back from the
/// store). Only edges meeting the threshold contribute.
pub fn clusters_from_edges(
    entries: &[Entry],
    edges: &[SimilarityEdge],
    threshold: f64,
    concept_assignments: &HashMap<String, (String, f64)>,
) -> Vec<CognateCluster> {
    let graph = SimilarityGraph::from_edges(
        edges
            .iter()
            .map(|edge| (edge.entry_a.clone(), edge.entry_b.clone(), edge.combined)),
        threshold,
    );

    let languages: HashMap<&str, &str> = entries
        .iter()
        .map(|entry| (entry.id.as_str(), entry.language.as_str()))
        .collect();

    // Mean combined score per cluster, computed over retained edges.
    let mut edge_lookup: HashMap<(&str, &str), f64> = HashMap::new();
    for edge in edges {
        if edge.combined >= threshold {
            edge_lookup.insert((edge.entry_a.as_str(), edge.entry_b.as_str()), edge.combined);
        }
    }

    graph
        .connected_components()
        .into_iter()
        .map(|component| {
            let members = component.members;

            let mut score_sum = 0.0;
            let mut score_count = 0usize;
            for (i, a) in members.iter().enumerate() {
                for b in members.iter().skip(i + 1) {
                    if let Some(score) = edge_lookup.get(&(a.as_str(), b.as_str())) {
                        score_sum += score;
                        score_count += 1;
                    }
                }
            }
            let confidence = if score_count > 0 {
                score_sum / score_count as f64
            } else {
                1.0
            };

            let cluster_languages: BTreeSet<String> = members
                .iter()
                .filter_map(|id| languages.get(id.as_str()).map(|lang| lang.to_string()))
                .collect();

            let concept_id = dominant_concept(&members, concept_assignments);
            let representative = members[0].clone();
            let size = members.len();

            CognateCluster {
                cluster_id: component.id,
                concept_id,
                members,
                languages: cluster_languages.into_iter().collect(),
                representative,
                confidence,
                size,
            }
        })
        .collect()
}

fn dominant_concept(
    members: &[String],
    assignments: &HashMap<String, (String, f64)>,
) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for member in members {
        if let Some((concept_id, _)) = assignments.get(member) {
            *counts.entry(concept_id.as_str()).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(concept_id, _)| concept_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::entry_id;
    use crate::similarity::SimilarityWeights;

    fn entry(headword: &str, ipa: &str, language: &str) -> Entry {
        Entry {
            id: entry_id(headword, language, "gloss"),
            headword: headword.to_string(),
            ipa: ipa.to_string(),
            language: language.to_string(),
            definition: "gloss".to_string(),
            etymology: None,
            pos_tag: None,
            embedding: None,
            raw_checksum: "0".repeat(64),
            source_id: "test".to_string(),
            pipeline_fingerprint: "fp".to_string(),
            quality: 1.0,
            validation_errors: Vec::new(),
            created_at_epoch_ms: 0,
        }
    }

    fn edge(a: &str, b: &str, combined: f64) -> SimilarityEdge {
        let (entry_a, entry_b) = if a <= b { (a, b) } else { (b, a) };
        SimilarityEdge {
            entry_a: entry_a.to_string(),
            entry_b: entry_b.to_string(),
            semantic: combined,
            phonetic: combined,
            etymological: 0.0,
            combined,
            weights: SimilarityWeights::new(0.5, 0.5, 0.0),
            phylo_distance: None,
        }
    }

    #[test]
    fn father_family_components() {
        // The classic scenario: a father triangle and a mother pair.
        let entries = vec![
            entry("father", "", "en"),
            entry("vater", "", "de"),
            entry("pater", "", "la"),
            entry("mother", "", "en"),
            entry("mutter", "", "de"),
        ];
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        let edges = vec![
            edge(&ids[0], &ids[1], 0.85),
            edge(&ids[0], &ids[2], 0.82),
            edge(&ids[1], &ids[2], 0.79),
            edge(&ids[3], &ids[4], 0.88),
        ];

        let clusters = clusters_from_edges(&entries, &edges, 0.7, &HashMap::new());
        assert_eq!(clusters.len(), 2);

        let father_cluster = clusters
            .iter()
            .find(|cluster| cluster.size == 3)
            .expect("father cluster");
        let mut expected: Vec<String> = ids[..3].to_vec();
        expected.sort();
        assert_eq!(father_cluster.members, expected);
        assert_eq!(father_cluster.languages, vec!["de", "en", "la"]);
        assert_eq!(father_cluster.representative, father_cluster.members[0]);
        assert!((father_cluster.confidence - (0.85 + 0.82 + 0.79) / 3.0).abs() < 1e-9);

        let mother_cluster = clusters
            .iter()
            .find(|cluster| cluster.size == 2)
            .expect("mother cluster");
        assert_eq!(mother_cluster.languages, vec!["de", "en"]);
    }

    #[test]
    fn threshold_splits_weak_edges() {
        let entries = vec![
            entry("father", "", "en"),
            entry("vater", "", "de"),
        ];
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        let edges = vec![edge(&ids[0], &ids[1], 0.5)];
        let clusters = clusters_from_edges(&entries, &edges, 0.7, &HashMap::new());
        assert!(clusters.is_empty());
    }

    #[test]
    fn clusters_are_invariant_under_edge_permutation() {
        let entries = vec![
            entry("father", "", "en"),
            entry("vater", "", "de"),
            entry("pater", "", "la"),
        ];
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        let mut edges = vec![
            edge(&ids[0], &ids[1], 0.85),
            edge(&ids[0], &ids[2], 0.82),
            edge(&ids[1], &ids[2], 0.79),
        ];
        let forward = clusters_from_edges(&entries, &edges, 0.7, &HashMap::new());
        edges.reverse();
        let reversed = clusters_from_edges(&entries, &edges, 0.7, &HashMap::new());
        assert_eq!(forward, reversed);
    }

    #[test]
    fn dominant_concept_is_majority_vote() {
        let entries = vec![
            entry("father", "", "en"),
            entry("vater", "", "de"),
            entry("pater", "", "la"),
        ];
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        let edges = vec![
            edge(&ids[0], &ids[1], 0.85),
            edge(&ids[0], &ids[2], 0.82),
        ];
        let mut assignments = HashMap::new();
        assignments.insert(ids[0].clone(), ("concept_0001".to_string(), 0.9));
        assignments.insert(ids[1].clone(), ("concept_0001".to_string(), 0.8));
        assignments.insert(ids[2].clone(), ("concept_0002".to_string(), 0.7));

        let clusters = clusters_from_edges(&entries, &edges, 0.7, &assignments);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].concept_id.as_deref(), Some("concept_0001"));
    }

    #[test]
    fn full_detection_finds_phonetic_cognates() {
        let mut entries = vec![
            entry("father", "ˈfɑðər", "en"),
            entry("vater", "ˈfatər", "de"),
            entry("okno", "ˈɔknɔ", "pl"),
        ];
        entries[0].embedding = Some(vec![1.0, 0.0]);
        entries[1].embedding = Some(vec![0.95, 0.05]);
        entries[2].embedding = Some(vec![0.0, 1.0]);
        let clusters = detect_cognates(
            &entries,
            &CognateParams::default(),
            &PhyloTable::empty(),
            &HashMap::new(),
        );
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].size, 2);
        assert_eq!(clusters[0].languages, vec!["de", "en"]);
    }
}
