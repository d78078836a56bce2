//! Storage traits and backends.
//!
//! The Postgres backend is the production path (bulk COPY staging + merge,
//! pgvector nearest-neighbor search); the in-memory backend implements the
//! same contracts for tests and dry runs.

mod memory;
mod postgres;

pub use memory::{
    MemoryCheckpointStore, MemoryEntryStore, MemoryRawStore, MemoryStoreProvider,
    MemoryTransformLogStore, MemoryVectorCache,
};
pub use postgres::{PgEntryStore, PgRawStore, PgStoreProvider, PgVectorCache};

use crate::entry::Entry;
use crate::errors::PipelineError;
use crate::pipeline::TransformStep;
use crate::records::RawRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A raw record plus its insertion-order cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRaw {
    /// Monotone cursor; scans resume strictly after this value.
    pub cursor: u64,
    /// The stored record.
    pub record: RawRecord,
}

/// Result of a raw bulk insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Records newly written by this batch.
    pub inserted: usize,
    /// Records silently kept because their checksum already existed.
    pub deduplicated: usize,
}

/// Filter applied to entry scans, counts, and knn queries.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    /// Restrict to one data source.
    pub source_id: Option<String>,
    /// Restrict to one language code.
    pub language: Option<String>,
    /// Only entries without an embedding.
    pub missing_embedding: bool,
}

impl EntryFilter {
    /// Filter matching every entry.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter restricted to a source.
    pub fn for_source(source_id: impl Into<String>) -> Self {
        Self {
            source_id: Some(source_id.into()),
            ..Self::default()
        }
    }

    fn matches(&self, entry: &Entry) -> bool {
        if let Some(source_id) = &self.source_id {
            if &entry.source_id != source_id {
                return false;
            }
        }
        if let Some(language) = &self.language {
            if &entry.language != language {
                return false;
            }
        }
        if self.missing_embedding && entry.embedding.is_some() {
            return false;
        }
        true
    }
}

/// Persisted pipeline progress for crash recovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Pipeline the checkpoint belongs to.
    pub pipeline_name: String,
    /// Checkpoint time, milliseconds since the Unix epoch.
    pub at_epoch_ms: u64,
    /// Total items known at checkpoint time.
    pub total: u64,
    /// Items pulled through the pipeline so far.
    pub processed: u64,
    /// Items written successfully.
    pub succeeded: u64,
    /// Items that failed.
    pub failed: u64,
    /// Items skipped (duplicates, quality gate).
    pub skipped: u64,
    /// Per-source raw-store cursor covered by committed writes.
    pub per_source_cursor: HashMap<String, u64>,
}

/// Append-only store of immutable raw records, deduplicated by checksum.
#[async_trait]
pub trait RawStore: Send + Sync {
    /// Atomically writes a batch. Existing checksums are silently kept; an
    /// existing checksum with a *different* payload is an integrity error
    /// and fails the whole batch.
    async fn bulk_insert(&self, records: &[RawRecord]) -> Result<InsertOutcome, PipelineError>;

    /// Reads records in insertion order, strictly after `after_cursor`.
    async fn scan(
        &self,
        source_id: Option<&str>,
        after_cursor: u64,
        limit: usize,
    ) -> Result<Vec<StoredRaw>, PipelineError>;

    /// Counts stored records, optionally restricted to one source.
    async fn count(&self, source_id: Option<&str>) -> Result<u64, PipelineError>;
}

/// Typed entry store with bulk upsert and vector search.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Upserts a batch keyed on entry id. Later pipelines overwrite earlier
    /// fields, but a present embedding is never replaced by an absent one.
    async fn bulk_upsert(&self, entries: &[Entry]) -> Result<usize, PipelineError>;

    /// Fills embeddings on existing entries without touching other fields.
    async fn bulk_update_embeddings(
        &self,
        updates: &[(String, Vec<f32>)],
    ) -> Result<usize, PipelineError>;

    /// Fetches one entry by id.
    async fn get(&self, id: &str) -> Result<Option<Entry>, PipelineError>;

    /// Scans entries in id order, strictly after `after_id`.
    async fn scan(
        &self,
        filter: &EntryFilter,
        after_id: &str,
        limit: usize,
    ) -> Result<Vec<Entry>, PipelineError>;

    /// Cosine nearest neighbors over stored embeddings, best first.
    async fn knn(
        &self,
        vector: &[f32],
        k: usize,
        filter: &EntryFilter,
    ) -> Result<Vec<(Entry, f32)>, PipelineError>;

    /// Counts entries matching the filter.
    async fn count(&self, filter: &EntryFilter) -> Result<u64, PipelineError>;
}

/// Store of pipeline checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists a checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PipelineError>;

    /// Latest checkpoint for a pipeline, if any.
    async fn latest(&self, pipeline_name: &str) -> Result<Option<Checkpoint>, PipelineError>;
}

/// Append-only transform provenance log, partitioned by raw checksum.
#[async_trait]
pub trait TransformLogStore: Send + Sync {
    /// Appends the steps recorded while cleaning one raw record.
    async fn append(
        &self,
        raw_checksum: &str,
        steps: &[TransformStep],
    ) -> Result<(), PipelineError>;
}

/// Constructs store handles for pipeline workers.
///
/// Postgres-backed workers open their own connection on their own runtime;
/// the memory provider hands out shared handles. Either way, a worker calls
/// this once at startup from inside its runtime.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Raw record store handle.
    async fn raw_store(&self) -> Result<Arc<dyn RawStore>, PipelineError>;
    /// Typed entry store handle.
    async fn entry_store(&self) -> Result<Arc<dyn EntryStore>, PipelineError>;
    /// Checkpoint store handle.
    async fn checkpoint_store(&self) -> Result<Arc<dyn CheckpointStore>, PipelineError>;
    /// Transform log handle.
    async fn transform_log(&self) -> Result<Arc<dyn TransformLogStore>, PipelineError>;
}

/// Cosine similarity between two vectors, in `[-1, 1]`.
pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
