//! In-memory store backend for tests and dry runs.

use super::{
    cosine, Checkpoint, CheckpointStore, EntryFilter, EntryStore, InsertOutcome, RawStore,
    StoreProvider, StoredRaw, TransformLogStore,
};
use crate::embedding::SharedVectorCache;
use crate::entry::Entry;
use crate::errors::PipelineError;
use crate::pipeline::TransformStep;
use crate::records::RawRecord;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// In-memory [`RawStore`] with the same dedup and ordering semantics as the
/// Postgres backend.
#[derive(Default)]
pub struct MemoryRawStore {
    inner: Mutex<RawInner>,
}

#[derive(Default)]
struct RawInner {
    by_checksum: HashMap<String, usize>,
    rows: Vec<RawRecord>,
}

impl MemoryRawStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RawStore for MemoryRawStore {
    async fn bulk_insert(&self, records: &[RawRecord]) -> Result<InsertOutcome, PipelineError> {
        let mut inner = self.inner.lock().expect("raw store mutex");

        // Validate the whole batch before mutating, so the write is atomic.
        for record in records {
            if let Some(&existing) = inner.by_checksum.get(&record.checksum) {
                if inner.rows[existing].payload != record.payload {
                    return Err(PipelineError::integrity(format!(
                        "checksum {} already stored with a different payload",
                        record.checksum
                    ))
                    .with_item(record.checksum.clone()));
                }
            }
        }

        let mut outcome = InsertOutcome::default();
        for record in records {
            if inner.by_checksum.contains_key(&record.checksum) {
                outcome.deduplicated += 1;
                continue;
            }
            let next_index = inner.rows.len();
            inner.by_checksum.insert(record.checksum.clone(), next_index);
            inner.rows.push(record.clone());
            outcome.inserted += 1;
        }
        Ok(outcome)
    }

    async fn scan(
        &self,
        source_id: Option<&str>,
        after_cursor: u64,
        limit: usize,
    ) -> Result<Vec<StoredRaw>, PipelineError> {
        let inner = self.inner.lock().expect("raw store mutex");
        let mut out = Vec::new();
        for (idx, record) in inner.rows.iter().enumerate() {
            let cursor = (idx + 1) as u64;
            if cursor <= after_cursor {
                continue;
            }
            if let Some(source) = source_id {
                if record.source_id != source {
                    continue;
                }
            }
            out.push(StoredRaw {
                cursor,
                record: record.clone(),
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn count(&self, source_id: Option<&str>) -> Result<u64, PipelineError> {
        let inner = self.inner.lock().expect("raw store mutex");
        let count = match source_id {
            Some(source) => inner
                .rows
                .iter()
                .filter(|record| record.source_id == source)
                .count(),
            None => inner.rows.len(),
        };
        Ok(count as u64)
    }
}

/// In-memory [`EntryStore`] with brute-force cosine knn.
#[derive(Default)]
pub struct MemoryEntryStore {
    inner: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryEntryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries, id-ordered. Test helper.
    pub fn dump(&self) -> Vec<Entry> {
        let inner = self.inner.lock().expect("entry store mutex");
        inner.values().cloned().collect()
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn bulk_upsert(&self, entries: &[Entry]) -> Result<usize, PipelineError> {
        let mut inner = self.inner.lock().expect("entry store mutex");
        for entry in entries {
            let mut incoming = entry.clone();
            if let Some(existing) = inner.get(&entry.id) {
                // Embeddings never revert to absent on reprocess.
                if incoming.embedding.is_none() {
                    incoming.embedding = existing.embedding.clone();
                }
            }
            inner.insert(incoming.id.clone(), incoming);
        }
        Ok(entries.len())
    }

    async fn bulk_update_embeddings(
        &self,
        updates: &[(String, Vec<f32>)],
    ) -> Result<usize, PipelineError> {
        let mut inner = self.inner.lock().expect("entry store mutex");
        let mut updated = 0;
        for (id, vector) in updates {
            if let Some(entry) = inner.get_mut(id) {
                entry.embedding = Some(vector.clone());
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn get(&self, id: &str) -> Result<Option<Entry>, PipelineError> {
        let inner = self.inner.lock().expect("entry store mutex");
        Ok(inner.get(id).cloned())
    }

    async fn scan(
        &self,
        filter: &EntryFilter,
        after_id: &str,
        limit: usize,
    ) -> Result<Vec<Entry>, PipelineError> {
        let inner = self.inner.lock().expect("entry store mutex");
        let out: Vec<Entry> = inner
            .range::<str, _>((
                std::ops::Bound::Excluded(after_id),
                std::ops::Bound::Unbounded,
            ))
            .map(|(_, entry)| entry)
            .filter(|entry| filter.matches(entry))
            .take(limit)
            .cloned()
            .collect();
        Ok(out)
    }

    async fn knn(
        &self,
        vector: &[f32],
        k: usize,
        filter: &EntryFilter,
    ) -> Result<Vec<(Entry, f32)>, PipelineError> {
        let inner = self.inner.lock().expect("entry store mutex");
        let mut scored: Vec<(Entry, f32)> = inner
            .values()
            .filter(|entry| filter.matches(entry))
            .filter_map(|entry| {
                entry
                    .embedding
                    .as_ref()
                    .map(|emb| (entry.clone(), cosine(emb, vector)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn count(&self, filter: &EntryFilter) -> Result<u64, PipelineError> {
        let inner = self.inner.lock().expect("entry store mutex");
        Ok(inner.values().filter(|entry| filter.matches(entry)).count() as u64)
    }
}

/// In-memory [`CheckpointStore`].
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().expect("checkpoint mutex");
        inner.insert(checkpoint.pipeline_name.clone(), checkpoint.clone());
        Ok(())
    }

    async fn latest(&self, pipeline_name: &str) -> Result<Option<Checkpoint>, PipelineError> {
        let inner = self.inner.lock().expect("checkpoint mutex");
        Ok(inner.get(pipeline_name).cloned())
    }
}

/// In-memory [`TransformLogStore`], inspectable from tests.
#[derive(Default)]
pub struct MemoryTransformLogStore {
    inner: Mutex<Vec<(String, TransformStep)>>,
}

impl MemoryTransformLogStore {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// All steps recorded for one raw checksum, in append order.
    pub fn steps_for(&self, raw_checksum: &str) -> Vec<TransformStep> {
        let inner = self.inner.lock().expect("transform log mutex");
        inner
            .iter()
            .filter(|(checksum, _)| checksum == raw_checksum)
            .map(|(_, step)| step.clone())
            .collect()
    }
}

#[async_trait]
impl TransformLogStore for MemoryTransformLogStore {
    async fn append(
        &self,
        raw_checksum: &str,
        steps: &[TransformStep],
    ) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().expect("transform log mutex");
        for step in steps {
            inner.push((raw_checksum.to_string(), step.clone()));
        }
        Ok(())
    }
}

/// In-memory shared vector cache.
#[derive(Default)]
pub struct MemoryVectorCache {
    inner: Mutex<HashMap<String, Vec<f32>>>,
}

impl MemoryVectorCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached vectors.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("vector cache mutex").len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SharedVectorCache for MemoryVectorCache {
    fn get_many(&self, hashes: &[String]) -> Result<Vec<Option<Vec<f32>>>, PipelineError> {
        let inner = self.inner.lock().expect("vector cache mutex");
        Ok(hashes.iter().map(|hash| inner.get(hash).cloned()).collect())
    }

    fn put_many(&self, items: &[(String, Vec<f32>)]) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().expect("vector cache mutex");
        for (hash, vector) in items {
            inner.entry(hash.clone()).or_insert_with(|| vector.clone());
        }
        Ok(())
    }
}

/// Shared-handle provider over the in-memory stores.
#[derive(Default, Clone)]
pub struct MemoryStoreProvider {
    raw: Arc<MemoryRawStore>,
    entries: Arc<MemoryEntryStore>,
    checkpoints: Arc<MemoryCheckpointStore>,
    transform_log: Arc<MemoryTransformLogStore>,
}

impl MemoryStoreProvider {
    /// Creates a provider with fresh empty stores.
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct handle to the entry store for assertions.
    pub fn entries(&self) -> Arc<MemoryEntryStore> {
        Arc::clone(&self.entries)
    }

    /// Direct handle to the raw store for assertions.
    pub fn raw(&self) -> Arc<MemoryRawStore> {
        Arc::clone(&self.raw)
    }

    /// Direct handle to the transform log for assertions.
    pub fn transform_log_handle(&self) -> Arc<MemoryTransformLogStore> {
        Arc::clone(&self.transform_log)
    }

    /// Direct handle to the checkpoint store for assertions.
    pub fn checkpoints(&self) -> Arc<MemoryCheckpointStore> {
        Arc::clone(&self.checkpoints)
    }
}

#[async_trait]
impl StoreProvider for MemoryStoreProvider {
    async fn raw_store(&self) -> Result<Arc<dyn RawStore>, PipelineError> {
        Ok(Arc::clone(&self.raw) as Arc<dyn RawStore>)
    }

    async fn entry_store(&self) -> Result<Arc<dyn EntryStore>, PipelineError> {
        Ok(Arc::clone(&self.entries) as Arc<dyn EntryStore>)
    }

    async fn checkpoint_store(&self) -> Result<Arc<dyn CheckpointStore>, PipelineError> {
        Ok(Arc::clone(&self.checkpoints) as Arc<dyn CheckpointStore>)
    }

    async fn transform_log(&self) -> Result<Arc<dyn TransformLogStore>, PipelineError> {
        Ok(Arc::clone(&self.transform_log) as Arc<dyn TransformLogStore>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::entry_id;
    use crate::records::Origin;
    use serde_json::json;

    fn raw(source: &str, headword: &str) -> RawRecord {
        RawRecord::new(
            source,
            json!({"headword": headword, "language": "en"}),
            Origin {
                file_path: "mem.jsonl".to_string(),
                line_no: 1,
            },
        )
    }

    fn entry(headword: &str, language: &str) -> Entry {
        Entry {
            id: entry_id(headword, language, "gloss"),
            headword: headword.to_string(),
            ipa: String::new(),
            language: language.to_string(),
            definition: "gloss".to_string(),
            etymology: None,
            pos_tag: None,
            embedding: None,
            raw_checksum: "0".repeat(64),
            source_id: "test".to_string(),
            pipeline_fingerprint: "fp1".to_string(),
            quality: 1.0,
            validation_errors: Vec::new(),
            created_at_epoch_ms: 0,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn raw_insert_is_idempotent_across_batches() {
        let store = MemoryRawStore::new();
        let record = raw("src", "father");

        let first = store.bulk_insert(&[record.clone()]).await.unwrap();
        assert_eq!(first.inserted, 1);

        let second = store
            .bulk_insert(&[record.clone(), raw("src", "mother")])
            .await
            .unwrap();
        assert_eq!(second.inserted, 1);
        assert_eq!(second.deduplicated, 1);
        assert_eq!(store.count(None).await.unwrap(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn checksum_collision_with_different_payload_is_integrity_error() {
        let store = MemoryRawStore::new();
        let record = raw("src", "father");
        store.bulk_insert(&[record.clone()]).await.unwrap();

        let mut forged = record.clone();
        forged.payload = json!({"headword": "forged", "language": "en"});
        let err = store.bulk_insert(&[forged]).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Integrity);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scan_resumes_after_cursor() {
        let store = MemoryRawStore::new();
        store
            .bulk_insert(&[raw("a", "one"), raw("b", "two"), raw("a", "three")])
            .await
            .unwrap();

        let page = store.scan(Some("a"), 0, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        let resumed = store.scan(Some("a"), page[0].cursor, 10).await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].record.field("headword"), Some("three"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn upsert_never_drops_an_embedding() {
        let store = MemoryEntryStore::new();
        let mut with_embedding = entry("father", "en");
        with_embedding.embedding = Some(vec![1.0, 0.0]);
        store.bulk_upsert(&[with_embedding.clone()]).await.unwrap();

        let mut reprocessed = entry("father", "en");
        reprocessed.embedding = None;
        reprocessed.pipeline_fingerprint = "fp2".to_string();
        store.bulk_upsert(&[reprocessed]).await.unwrap();

        let stored = store.get(&with_embedding.id).await.unwrap().unwrap();
        assert_eq!(stored.pipeline_fingerprint, "fp2");
        assert_eq!(stored.embedding, Some(vec![1.0, 0.0]));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn knn_ranks_by_cosine() {
        let store = MemoryEntryStore::new();
        let mut close = entry("father", "en");
        close.embedding = Some(vec![1.0, 0.0]);
        let mut far = entry("banana", "en");
        far.embedding = Some(vec![0.0, 1.0]);
        store.bulk_upsert(&[close.clone(), far]).await.unwrap();

        let hits = store
            .knn(&[1.0, 0.1], 2, &EntryFilter::all())
            .await
            .unwrap();
        assert_eq!(hits[0].0.id, close.id);
        assert!(hits[0].1 > hits[1].1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scan_filters_missing_embeddings() {
        let store = MemoryEntryStore::new();
        let mut embedded = entry("father", "en");
        embedded.embedding = Some(vec![1.0]);
        store
            .bulk_upsert(&[embedded, entry("mother", "en")])
            .await
            .unwrap();

        let filter = EntryFilter {
            missing_embedding: true,
            ..EntryFilter::default()
        };
        let page = store.scan(&filter, "", 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].headword, "mother");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn checkpoints_round_trip() {
        let store = MemoryCheckpointStore::new();
        assert!(store.latest("ingest").await.unwrap().is_none());
        let checkpoint = Checkpoint {
            pipeline_name: "ingest".to_string(),
            processed: 100,
            ..Checkpoint::default()
        };
        store.save(&checkpoint).await.unwrap();
        assert_eq!(store.latest("ingest").await.unwrap(), Some(checkpoint));
    }
}
