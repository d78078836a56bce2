//! Enrichment pipeline: fills entry embeddings in batched encoder calls
//! behind the two-level cache, under backpressure.

use crate::cleaners::{Cleaner, TextNormalizer};
use crate::debug_log;
use crate::embedding::{CachedEmbedder, Embedder};
use crate::entry::epoch_ms_now;
use crate::errors::PipelineError;
use crate::stage::{
    io_runtime, recv_batch, send_checked, PipelineControl, ProgressMonitor, StageCounters,
    WorkerPool,
};
use crate::store::{Checkpoint, EntryFilter, StoreProvider};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tuning knobs for one enrichment run.
#[derive(Debug, Clone)]
pub struct EnrichConfig {
    /// Restrict to entries from one source.
    pub source_id: Option<String>,
    /// Entries per store scan batch.
    pub scan_batch: usize,
    /// Texts per encoder call.
    pub embed_batch: usize,
    /// Parallel normalizer/cache-lookup workers.
    pub lookup_workers: usize,
    /// Parallel store writers.
    pub writers: usize,
    /// Re-embed entries that already carry an embedding.
    pub recompute: bool,
    /// Checkpoint cadence, in processed entries.
    pub checkpoint_every: u64,
    /// Inter-stage queue capacity, in batches.
    pub queue_capacity: usize,
    /// Idle flush for partial batches.
    pub idle_flush: Duration,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            source_id: None,
            scan_batch: 2_048,
            embed_batch: 512,
            lookup_workers: 2,
            writers: 2,
            recompute: false,
            checkpoint_every: 10_000,
            queue_capacity: 2,
            idle_flush: Duration::from_millis(200),
        }
    }
}

/// Counters reported at the end of an enrichment run.
#[derive(Debug, Clone, Default)]
pub struct EnrichReport {
    /// Entries pulled from the store.
    pub scanned: u64,
    /// Vectors produced by the encoder (cache misses).
    pub encoded: u64,
    /// Vectors answered by the cache.
    pub cache_hits: u64,
    /// Embeddings written back.
    pub written: u64,
    /// Cache hit rate over this run's lookups.
    pub cache_hit_rate: f64,
    /// Wall time of the run.
    pub elapsed: Duration,
}

const PIPELINE_NAME: &str = "enrich";

struct EmbedItem {
    id: String,
    text: String,
    vector: Option<Vec<f32>>,
}

struct EmbedBatch {
    batch_id: u64,
    items: Vec<EmbedItem>,
}

/// Runs the enrichment pipeline over entries missing an embedding (or all
/// entries with `recompute`). Reprocessing is idempotent: writes are keyed
/// by entry id and already-embedded entries are filtered out up front.
pub fn run_enrich(
    provider: Arc<dyn StoreProvider>,
    embedder: Arc<CachedEmbedder>,
    config: EnrichConfig,
) -> Result<EnrichReport, PipelineError> {
    let started = Instant::now();
    let stats_before = embedder.stats();
    let control = PipelineControl::new();

    let (lookup_tx, lookup_rx) = bounded::<EmbedBatch>(config.queue_capacity);
    let (embed_tx, embed_rx) = bounded::<EmbedBatch>(config.queue_capacity);
    let (write_tx, write_rx) = bounded::<EmbedBatch>(config.queue_capacity);

    let reader_counters = StageCounters::new();
    let lookup_counters = StageCounters::new();
    let embed_counters = StageCounters::new();
    let writer_counters = StageCounters::new();

    let scanned = Arc::new(AtomicU64::new(0));
    let encoded = Arc::new(AtomicU64::new(0));
    let cache_hits = Arc::new(AtomicU64::new(0));
    let written = Arc::new(AtomicU64::new(0));
    let monitor_done = Arc::new(AtomicBool::new(false));

    let mut monitor = ProgressMonitor::new(PIPELINE_NAME, None);
    monitor.track("entry-reader", Arc::clone(&reader_counters), {
        let rx = lookup_rx.clone();
        Some(Box::new(move || rx.len()))
    });
    monitor.track("cache-lookup", Arc::clone(&lookup_counters), {
        let rx = embed_rx.clone();
        Some(Box::new(move || rx.len()))
    });
    monitor.track("embedder", Arc::clone(&embed_counters), {
        let rx = write_rx.clone();
        Some(Box::new(move || rx.len()))
    });
    monitor.track("entry-writer", Arc::clone(&writer_counters), None);
    let monitor_handle = monitor.spawn(
        Arc::clone(&control),
        Duration::from_secs(5),
        Arc::clone(&monitor_done),
    );

    // Stage 1: entry reader.
    let reader_pool = {
        let control = Arc::clone(&control);
        let counters = Arc::clone(&reader_counters);
        let scanned = Arc::clone(&scanned);
        let provider = Arc::clone(&provider);
        let config = config.clone();
        WorkerPool::spawn("entry-reader", 1, Arc::clone(&control), move |_worker| {
            let runtime = io_runtime()?;
            runtime.block_on(async {
                let store = provider
                    .entry_store()
                    .await
                    .map_err(|err| err.in_stage(PIPELINE_NAME, "entry-reader"))?;
                let filter = EntryFilter {
                    source_id: config.source_id.clone(),
                    language: None,
                    missing_embedding: !config.recompute,
                };

                let mut after_id = String::new();
                let mut batch_id = 0u64;
                let mut pending: Vec<EmbedItem> = Vec::with_capacity(config.embed_batch);
                loop {
                    if control.stop_requested() {
                        break;
                    }
                    let page = store
                        .scan(&filter, &after_id, config.scan_batch)
                        .await
                        .map_err(|err| err.in_stage(PIPELINE_NAME, "entry-reader"))?;
                    if page.is_empty() {
                        break;
                    }
                    after_id = page.last().map(|entry| entry.id.clone()).unwrap_or_default();

                    for entry in page {
                        scanned.fetch_add(1, Ordering::Relaxed);
                        counters.add_received(1);
                        pending.push(EmbedItem {
                            id: entry.id,
                            text: entry.definition,
                            vector: None,
                        });
                        if pending.len() >= config.embed_batch {
                            let items = std::mem::replace(
                                &mut pending,
                                Vec::with_capacity(config.embed_batch),
                            );
                            counters.add_emitted(items.len() as u64);
                            let batch = EmbedBatch { batch_id, items };
                            batch_id += 1;
                            if !send_checked(&lookup_tx, batch, &control) {
                                return Ok(());
                            }
                        }
                    }
                }
                if !pending.is_empty() {
                    counters.add_emitted(pending.len() as u64);
                    send_checked(
                        &lookup_tx,
                        EmbedBatch {
                            batch_id,
                            items: pending,
                        },
                        &control,
                    );
                }
                Ok::<(), PipelineError>(())
            })
        })
    };

    // Stage 2: text normalization + cache lookup.
    let lookup_pool = {
        let control = Arc::clone(&control);
        let counters = Arc::clone(&lookup_counters);
        let cache_hits = Arc::clone(&cache_hits);
        let embedder = Arc::clone(&embedder);
        let lookup_rx = lookup_rx.clone();
        let embed_tx = embed_tx.clone();
        WorkerPool::spawn(
            "cache-lookup",
            config.lookup_workers.max(1),
            Arc::clone(&control),
            move |_worker| {
                let normalizer = TextNormalizer::new();
                while let Some(batches) =
                    recv_batch(&lookup_rx, 1, Duration::from_millis(100), &control)
                {
                    for mut batch in batches {
                        counters.add_received(batch.items.len() as u64);
                        for item in batch.items.iter_mut() {
                            item.text = normalizer.clean(&item.text);
                        }
                        let texts: Vec<&str> =
                            batch.items.iter().map(|item| item.text.as_str()).collect();
                        let found = embedder.lookup(&texts);
                        let mut hits = 0u64;
                        for (item, vector) in batch.items.iter_mut().zip(found) {
                            if vector.is_some() {
                                hits += 1;
                            }
                            item.vector = vector;
                        }
                        cache_hits.fetch_add(hits, Ordering::Relaxed);
                        counters.add_emitted(batch.items.len() as u64);
                        if !send_checked(&embed_tx, batch, &control) {
                            return Ok(());
                        }
                    }
                }
                Ok(())
            },
        )
    };
    drop(lookup_rx);
    drop(embed_tx);

    // Stage 3: batched encoding; single worker, one compute device.
    let embed_pool = {
        let control = Arc::clone(&control);
        let counters = Arc::clone(&embed_counters);
        let encoded = Arc::clone(&encoded);
        let embedder = Arc::clone(&embedder);
        let embed_rx = embed_rx.clone();
        let write_tx = write_tx.clone();
        WorkerPool::spawn("embedder", 1, Arc::clone(&control), move |_worker| {
            while let Some(batches) = recv_batch(&embed_rx, 1, Duration::from_millis(100), &control)
            {
                for mut batch in batches {
                    counters.add_received(batch.items.len() as u64);
                    let missing: Vec<usize> = batch
                        .items
                        .iter()
                        .enumerate()
                        .filter(|(_, item)| item.vector.is_none())
                        .map(|(idx, _)| idx)
                        .collect();
                    if !missing.is_empty() {
                        let texts: Vec<&str> = missing
                            .iter()
                            .map(|&idx| batch.items[idx].text.as_str())
                            .collect();
                        let vectors = embedder
                            .encode(&texts)
                            .map_err(|err| err.in_stage(PIPELINE_NAME, "embedder"))?;
                        encoded.fetch_add(vectors.len() as u64, Ordering::Relaxed);
                        debug_log!(
                            "batch {}: encoded {} of {} texts",
                            batch.batch_id,
                            vectors.len(),
                            batch.items.len()
                        );
                        for (&idx, vector) in missing.iter().zip(vectors) {
                            batch.items[idx].vector = Some(vector);
                        }
                    }
                    counters.add_emitted(batch.items.len() as u64);
                    if !send_checked(&write_tx, batch, &control) {
                        return Ok(());
                    }
                }
            }
            Ok(())
        })
    };
    drop(embed_rx);
    drop(write_tx);

    // Stage 4: bulk write-back.
    let writer_pool = {
        let control = Arc::clone(&control);
        let counters = Arc::clone(&writer_counters);
        let written = Arc::clone(&written);
        let scanned = Arc::clone(&scanned);
        let encoded = Arc::clone(&encoded);
        let provider = Arc::clone(&provider);
        let config = config.clone();
        let write_rx = write_rx.clone();
        let last_checkpointed = Arc::new(AtomicU64::new(0));
        WorkerPool::spawn("entry-writer", config.writers.max(1), Arc::clone(&control), move |_worker| {
            let runtime = io_runtime()?;
            runtime.block_on(async {
                let store = provider
                    .entry_store()
                    .await
                    .map_err(|err| err.in_stage(PIPELINE_NAME, "entry-writer"))?;
                let checkpoints = provider
                    .checkpoint_store()
                    .await
                    .map_err(|err| err.in_stage(PIPELINE_NAME, "entry-writer"))?;

                while let Some(batches) = recv_batch(&write_rx, 1, config.idle_flush, &control) {
                    for batch in batches {
                        counters.add_received(batch.items.len() as u64);
                        let updates: Vec<(String, Vec<f32>)> = batch
                            .items
                            .into_iter()
                            .filter_map(|item| item.vector.map(|vector| (item.id, vector)))
                            .collect();

                        let mut attempt = 0usize;
                        let count = loop {
                            match store.bulk_update_embeddings(&updates).await {
                                Ok(count) => break count,
                                Err(err)
                                    if err.is_retriable()
                                        && attempt + 1 < 5
                                        && !control.stop_requested() =>
                                {
                                    attempt += 1;
                                    let delay =
                                        Duration::from_millis(250 * (1 << attempt.min(5) as u32));
                                    eprintln!(
                                        "embedding write retry {attempt}: {err}; backing off {delay:?}..."
                                    );
                                    tokio::time::sleep(delay).await;
                                }
                                Err(err) => {
                                    let first = updates
                                        .first()
                                        .map(|(id, _)| id.clone())
                                        .unwrap_or_default();
                                    return Err(err
                                        .in_stage(PIPELINE_NAME, "entry-writer")
                                        .with_batch(batch.batch_id)
                                        .with_item(first));
                                }
                            }
                        };
                        written.fetch_add(count as u64, Ordering::Relaxed);
                        counters.add_emitted(count as u64);

                        let done = written.load(Ordering::Relaxed);
                        let since =
                            done.saturating_sub(last_checkpointed.load(Ordering::Relaxed));
                        if since >= config.checkpoint_every {
                            last_checkpointed.store(done, Ordering::Relaxed);
                            save_checkpoint(checkpoints.as_ref(), &scanned, &encoded, &written)
                                .await?;
                        }
                    }
                }

                save_checkpoint(checkpoints.as_ref(), &scanned, &encoded, &written).await?;
                Ok::<(), PipelineError>(())
            })
        })
    };
    drop(write_rx);

    reader_pool.join();
    lookup_pool.join();
    embed_pool.join();
    writer_pool.join();
    monitor_done.store(true, Ordering::Release);
    let _ = monitor_handle.join();

    if let Some(err) = control.take_fatal() {
        return Err(err);
    }

    // Hit rate is per-run: the delta over the embedder's lifetime counters.
    let stats = embedder.stats();
    let run_hits = stats.hits.saturating_sub(stats_before.hits);
    let run_misses = stats.misses.saturating_sub(stats_before.misses);
    let cache_hit_rate = if run_hits + run_misses == 0 {
        0.0
    } else {
        run_hits as f64 / (run_hits + run_misses) as f64
    };
    let report = EnrichReport {
        scanned: scanned.load(Ordering::Relaxed),
        encoded: encoded.load(Ordering::Relaxed),
        cache_hits: cache_hits.load(Ordering::Relaxed),
        written: written.load(Ordering::Relaxed),
        cache_hit_rate,
        elapsed: started.elapsed(),
    };
    eprintln!(
        "enrichment complete: {} scanned, {} encoded, {} cache hits, {} written, \
         hit rate {:.3} in {:.1}s",
        report.scanned,
        report.encoded,
        report.cache_hits,
        report.written,
        report.cache_hit_rate,
        report.elapsed.as_secs_f64(),
    );
    Ok(report)
}

async fn save_checkpoint(
    store: &dyn crate::store::CheckpointStore,
    scanned: &AtomicU64,
    encoded: &AtomicU64,
    written: &AtomicU64,
) -> Result<(), PipelineError> {
    let checkpoint = Checkpoint {
        pipeline_name: PIPELINE_NAME.to_string(),
        at_epoch_ms: epoch_ms_now(),
        total: scanned.load(Ordering::Relaxed),
        processed: encoded.load(Ordering::Relaxed),
        succeeded: written.load(Ordering::Relaxed),
        failed: 0,
        skipped: 0,
        per_source_cursor: std::collections::HashMap::new(),
    };
    store
        .save(&checkpoint)
        .await
        .map_err(|err| err.in_stage(PIPELINE_NAME, "checkpoint"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{CachedEmbedder, HashingEmbedder};
    use crate::entry::{entry_id, Entry};
    use crate::store::{EntryStore, MemoryStoreProvider};

    fn entry(headword: &str, definition: &str) -> Entry {
        Entry {
            id: entry_id(headword, "en", definition),
            headword: headword.to_string(),
            ipa: String::new(),
            language: "en".to_string(),
            definition: definition.to_string(),
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

    fn small_config() -> EnrichConfig {
        EnrichConfig {
            scan_batch: 4,
            embed_batch: 3,
            lookup_workers: 2,
            writers: 2,
            idle_flush: Duration::from_millis(20),
            ..EnrichConfig::default()
        }
    }

    fn seeded_provider(n: usize) -> Arc<MemoryStoreProvider> {
        let provider = Arc::new(MemoryStoreProvider::new());
        let entries: Vec<Entry> = (0..n)
            .map(|i| entry(&format!("word{i}"), &format!("meaning number {i}")))
            .collect();
        let store = provider.entries();
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(async { store.bulk_upsert(&entries).await.unwrap() });
        provider
    }

    #[test]
    fn fills_every_missing_embedding() {
        let provider = seeded_provider(10);
        let embedder = Arc::new(CachedEmbedder::new(Arc::new(HashingEmbedder::new(32)), 1000));

        let report = run_enrich(provider.clone(), embedder, small_config()).unwrap();
        assert_eq!(report.scanned, 10);
        assert_eq!(report.written, 10);

        for stored in provider.entries().dump() {
            let embedding = stored.embedding.expect("embedding filled");
            assert_eq!(embedding.len(), 32);
        }
    }

    #[test]
    fn second_run_has_nothing_to_do() {
        let provider = seeded_provider(6);
        let embedder = Arc::new(CachedEmbedder::new(Arc::new(HashingEmbedder::new(16)), 1000));

        run_enrich(provider.clone(), Arc::clone(&embedder), small_config()).unwrap();
        let second = run_enrich(provider, embedder, small_config()).unwrap();
        assert_eq!(second.scanned, 0);
        assert_eq!(second.written, 0);
    }

    #[test]
    fn recompute_run_is_answered_by_the_cache() {
        let provider = seeded_provider(8);
        let embedder = Arc::new(CachedEmbedder::new(Arc::new(HashingEmbedder::new(16)), 1000));

        run_enrich(provider.clone(), Arc::clone(&embedder), small_config()).unwrap();
        let mut config = small_config();
        config.recompute = true;
        let second = run_enrich(provider, Arc::clone(&embedder), config).unwrap();
        assert_eq!(second.scanned, 8);
        assert_eq!(second.encoded, 0, "all vectors should come from cache");
        assert_eq!(second.cache_hits, 8);
        assert!(second.cache_hit_rate > 0.0);
    }

    #[test]
    fn embeddings_are_deterministic_for_equal_definitions() {
        let provider = Arc::new(MemoryStoreProvider::new());
        let store = provider.entries();
        let a = entry("father", "male parent");
        let b = entry("vater", "male parent");
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(async { store.bulk_upsert(&[a.clone(), b.clone()]).await.unwrap() });

        let embedder = Arc::new(CachedEmbedder::new(Arc::new(HashingEmbedder::new(24)), 100));
        run_enrich(provider.clone(), embedder, small_config()).unwrap();

        let dump = provider.entries().dump();
        assert_eq!(dump[0].embedding, dump[1].embedding);
    }
}
