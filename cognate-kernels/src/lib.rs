//! Deterministic compute kernels for cognate analysis.
//!
//! This crate holds the CPU-bound pieces of the pipeline: feature-weighted
//! phonetic alignment over IPA strings, similarity-graph algorithms, and
//! clustering primitives. Everything here is pure and deterministic given
//! its inputs; batch entry points parallelize with rayon.

mod cluster;
mod graph;
mod phonetic;

pub use cluster::{
    density_cluster, threshold_components, DensityClustering, DensityParams, UnionFind,
};
pub use graph::{Component, GraphStats, SimilarityGraph};
pub use phonetic::{
    batch_similarity, dtw_distance, dtw_similarity, grapheme_similarity, segment_ipa, IpaSegment,
    FEATURE_DIM,
};
