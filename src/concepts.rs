//! Cross-lingual concept discovery and assignment.
//!
//! Entry embeddings are projected to a low dimension with a seeded sparse
//! random projection, density-clustered, and summarized into concept
//! centroids. Later entries are assigned to the nearest centroid by cosine
//! similarity, with a floor below which they stay unassigned.

use crate::entry::Entry;
use cognate_kernels::{density_cluster, DensityParams};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A discovered cross-lingual semantic cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    /// Stable concept identifier.
    pub concept_id: String,
    /// Mean of the member embeddings at discovery time.
    pub centroid: Vec<f32>,
    /// Number of member entries.
    pub member_count: usize,
    /// Languages covered by the members, sorted.
    pub languages: Vec<String>,
    /// Fraction of members that met the core-density criterion.
    pub confidence: f64,
    /// Member entry ids, sorted.
    pub member_ids: Vec<String>,
}

/// Tuning for concept discovery and assignment.
#[derive(Debug, Clone)]
pub struct ConceptConfig {
    /// Target dimension of the clustering projection.
    pub reduce_dim: usize,
    /// Density neighborhood radius in projected space.
    pub eps: f64,
    /// Minimum neighborhood size for a core point.
    pub min_samples: usize,
    /// Clusters smaller than this dissolve into noise.
    pub min_cluster_size: usize,
    /// Cosine floor below which `assign` returns no concept.
    pub min_assign_similarity: f64,
    /// Projection seed; fixed so discovery is reproducible.
    pub seed: u64,
}

impl Default for ConceptConfig {
    fn default() -> Self {
        Self {
            reduce_dim: 10,
            eps: 0.35,
            min_samples: 4,
            min_cluster_size: 4,
            min_assign_similarity: 0.5,
            seed: 42,
        }
    }
}

/// Discovers concepts from embedded entries and assigns entries to them.
pub struct ConceptAligner {
    config: ConceptConfig,
    concepts: Vec<Concept>,
}

impl ConceptAligner {
    /// Aligner with no discovered concepts yet.
    pub fn new(config: ConceptConfig) -> Self {
        Self {
            config,
            concepts: Vec::new(),
        }
    }

    /// The concepts discovered so far.
    pub fn concepts(&self) -> &[Concept] {
        &self.concepts
    }

    /// Clusters the given entries (those carrying embeddings) into concepts.
    /// Entries labeled noise by the density clustering belong to no concept.
    pub fn discover(&mut self, entries: &[Entry]) -> &[Concept] {
        let embedded: Vec<&Entry> = entries
            .iter()
            .filter(|entry| entry.embedding.is_some())
            .collect();
        if embedded.is_empty() {
            self.concepts = Vec::new();
            return &self.concepts;
        }

        let dimension = embedded[0]
            .embedding
            .as_ref()
            .map(Vec::len)
            .unwrap_or_default();
        let projection = projection_matrix(dimension, self.config.reduce_dim, self.config.seed);

        let projected: Vec<Vec<f64>> = embedded
            .iter()
            .map(|entry| project(entry.embedding.as_ref().expect("filtered"), &projection))
            .collect();

        let clustering = density_cluster(
            &projected,
            &DensityParams {
                eps: self.config.eps,
                min_samples: self.config.min_samples,
                min_cluster_size: self.config.min_cluster_size,
            },
        );

        let mut members: HashMap<i64, Vec<usize>> = HashMap::new();
        for (idx, &label) in clustering.labels.iter().enumerate() {
            if label >= 0 {
                members.entry(label).or_default().push(idx);
            }
        }

        let mut labels: Vec<i64> = members.keys().copied().collect();
        labels.sort_unstable();

        self.concepts = labels
            .into_iter()
            .map(|label| {
                let indices = &members[&label];
                let centroid = mean_embedding(
                    indices
                        .iter()
                        .map(|&idx| embedded[idx].embedding.as_ref().expect("filtered")),
                    dimension,
                );
                let languages: BTreeSet<String> = indices
                    .iter()
                    .map(|&idx| embedded[idx].language.clone())
                    .collect();
                let core_members = indices
                    .iter()
                    .filter(|&&idx| clustering.core[idx])
                    .count();
                let mut member_ids: Vec<String> = indices
                    .iter()
                    .map(|&idx| embedded[idx].id.clone())
                    .collect();
                member_ids.sort();

                Concept {
                    concept_id: format!("concept_{label:04}"),
                    centroid,
                    member_count: indices.len(),
                    languages: languages.into_iter().collect(),
                    confidence: core_members as f64 / indices.len() as f64,
                    member_ids,
                }
            })
            .collect();
        &self.concepts
    }

    /// Nearest-centroid assignment by cosine similarity; below the floor the
    /// entry stays unassigned.
    pub fn assign(&self, embedding: &[f32]) -> Option<(String, f64)> {
        let mut best: Option<(&Concept, f64)> = None;
        for concept in &self.concepts {
            let similarity = crate::store::cosine(&concept.centroid, embedding) as f64;
            match best {
                Some((_, current)) if current >= similarity => {}
                _ => best = Some((concept, similarity)),
            }
        }
        best.and_then(|(concept, similarity)| {
            (similarity >= self.config.min_assign_similarity)
                .then(|| (concept.concept_id.clone(), similarity))
        })
    }

    /// Assigns many entries at once; entries without embeddings or below the
    /// similarity floor are omitted.
    pub fn batch_assign(&self, entries: &[Entry]) -> HashMap<String, (String, f64)> {
        entries
            .iter()
            .filter_map(|entry| {
                let embedding = entry.embedding.as_ref()?;
                let (concept_id, confidence) = self.assign(embedding)?;
                Some((entry.id.clone(), (concept_id, confidence)))
            })
            .collect()
    }
}

/// Sparse Achlioptas-style random projection matrix, deterministic in the
/// seed. Entries are `±sqrt(3 / reduce_dim)` with probability 1/6 each and
/// zero otherwise.
fn projection_matrix(dimension: usize, reduce_dim: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let scale = (3.0 / reduce_dim as f64).sqrt();
    (0..reduce_dim)
        .map(|_| {
            (0..dimension)
                .map(|_| match rng.gen_range(0..6) {
                    0 => scale,
                    1 => -scale,
                    _ => 0.0,
                })
                .collect()
        })
        .collect()
}

fn project(embedding: &[f32], projection: &[Vec<f64>]) -> Vec<f64> {
    projection
        .iter()
        .map(|row| {
            row.iter()
                .zip(embedding.iter())
                .map(|(weight, value)| weight * *value as f64)
                .sum()
        })
        .collect()
}

fn mean_embedding<'a>(vectors: impl Iterator<Item = &'a Vec<f32>>, dimension: usize) -> Vec<f32> {
    let mut sum = vec![0.0f32; dimension];
    let mut count = 0usize;
    for vector in vectors {
        for (slot, value) in sum.iter_mut().zip(vector.iter()) {
            *slot += value;
        }
        count += 1;
    }
    if count > 0 {
        for slot in sum.iter_mut() {
            *slot /= count as f32;
        }
    }
    sum
}
