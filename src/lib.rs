#![warn(missing_docs)]
//! Core library for the lexflow bulk lexical processing pipeline.
//!
//! Raw dictionary records stream in from heterogeneous sources, land in an
//! immutable checksummed raw store, get cleaned and validated into typed
//! entries, and are enriched with cached batch embeddings. Cognate analysis
//! (phonetic alignment, similarity graphs, concept clustering) sits on top
//! of the stored entries.

pub mod cleaners;
pub mod cognates;
pub mod concepts;
pub mod embedding;
pub mod enrich;
pub mod entry;
pub mod errors;
pub mod ingest;
pub mod loaders;
pub mod phylo;
pub mod pipeline;
pub mod records;
pub mod similarity;
pub mod stage;
pub mod store;
pub mod validate;

pub use embedding::{CachedEmbedder, Embedder, HashingEmbedder, RemoteEmbedder};
pub use entry::{entry_id, Entry};
pub use errors::{ErrorKind, PipelineError};
pub use loaders::{format_loader, LoadError, Loader};
pub use pipeline::{CleanerPipeline, FieldPipelines, TransformStep};
pub use records::{payload_checksum, Origin, RawRecord};
pub use stage::{PipelineControl, StageCounters};
pub use store::{EntryStore, MemoryEntryStore, MemoryRawStore, RawStore};

/// Per-item/per-worker trace lines, compiled in only with the `debug_logs`
/// feature. The expansion is empty otherwise, so hot loops pay nothing.
#[cfg(feature = "debug_logs")]
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

/// Per-item/per-worker trace lines, compiled in only with the `debug_logs`
/// feature. The expansion is empty otherwise, so hot loops pay nothing.
#[cfg(not(feature = "debug_logs"))]
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}
