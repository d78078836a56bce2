//! Ingestion pipeline: file → raw store → cleaners → validated entries.
//!
//! Phase 1 streams raw records out of the source file and bulk-loads them
//! into the immutable raw store, deduplicating by checksum. Phase 2 scans
//! the raw store by cursor, cleans and validates in parallel, and bulk
//! upserts typed entries, checkpointing the committed cursor prefix.

use crate::debug_log;
use crate::entry::{entry_id, epoch_ms_now, primary_gloss, Entry};
use crate::errors::PipelineError;
use crate::loaders::{format_loader, LoadError};
use crate::pipeline::{FieldPipelines, TransformStep};
use crate::records::RawRecord;
use crate::stage::{
    io_runtime, recv_batch, send_checked, CompletionTracker, ErrorWindow, PipelineControl,
    ProgressMonitor, StageCounters, WorkerPool,
};
use crate::store::{Checkpoint, StoreProvider, StoredRaw};
use crate::validate::{quality_score, EntryValidator};
use crossbeam_channel::bounded;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Tuning knobs for one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Source file to ingest.
    pub file: PathBuf,
    /// Data source identifier recorded on every record.
    pub source_id: String,
    /// Input format (`json`, `cldf`, `starling`, `tei`, `csv`).
    pub format: String,
    /// Records per file-read batch.
    pub load_batch: usize,
    /// Records per raw-store COPY batch.
    pub raw_write_batch: usize,
    /// Records per cleaner input batch.
    pub clean_batch: usize,
    /// Entries per typed-store COPY batch.
    pub write_batch: usize,
    /// Parallel cleaner workers.
    pub cleaner_workers: usize,
    /// Parallel typed-store writers.
    pub writers: usize,
    /// Entries below this quality are skipped instead of stored.
    pub quality_threshold: f64,
    /// Checkpoint cadence, in processed records.
    pub checkpoint_every: u64,
    /// Inter-stage queue capacity, in batches.
    pub queue_capacity: usize,
    /// Idle flush for partial batches.
    pub idle_flush: Duration,
    /// Per-record failures tolerated per minute before aborting.
    pub max_errors_per_minute: usize,
    /// Resume phase 2 from the latest committed checkpoint cursor.
    pub resume: bool,
    /// Parse and count only; write nothing.
    pub dry_run: bool,
}

impl IngestConfig {
    /// Defaults sized for bulk throughput.
    pub fn new(file: PathBuf, source_id: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            file,
            source_id: source_id.into(),
            format: format.into(),
            load_batch: 20_000,
            raw_write_batch: 10_000,
            clean_batch: 5_000,
            write_batch: 10_000,
            cleaner_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            writers: 2,
            quality_threshold: 0.5,
            checkpoint_every: 10_000,
            queue_capacity: 2,
            idle_flush: Duration::from_millis(200),
            max_errors_per_minute: 10_000,
            resume: false,
            dry_run: false,
        }
    }
}

/// Counters reported at the end of an ingestion run.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    /// Records parsed out of the source file.
    pub loaded: u64,
    /// Records skipped due to per-record parse failures.
    pub parse_errors: u64,
    /// Raw records newly written.
    pub raw_inserted: u64,
    /// Raw records dropped as checksum duplicates.
    pub raw_deduplicated: u64,
    /// Raw records pulled through the cleaner stage.
    pub processed: u64,
    /// Records dropped by cleaning/validation.
    pub invalid: u64,
    /// Entries dropped as intra-run id duplicates.
    pub duplicates_skipped: u64,
    /// Entries upserted into the typed store.
    pub entries_written: u64,
    /// Wall time of the whole run.
    pub elapsed: Duration,
}

#[derive(Default)]
struct IngestTotals {
    loaded: AtomicU64,
    parse_errors: AtomicU64,
    raw_inserted: AtomicU64,
    raw_deduplicated: AtomicU64,
    processed: AtomicU64,
    invalid: AtomicU64,
    duplicates_skipped: AtomicU64,
    entries_written: AtomicU64,
}

impl IngestTotals {
    fn report(&self, elapsed: Duration) -> IngestReport {
        IngestReport {
            loaded: self.loaded.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            raw_inserted: self.raw_inserted.load(Ordering::Relaxed),
            raw_deduplicated: self.raw_deduplicated.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            entries_written: self.entries_written.load(Ordering::Relaxed),
            elapsed,
        }
    }
}

const PIPELINE_NAME: &str = "ingest";

/// Runs the full ingestion pipeline: load (phase 1) then transform (phase 2).
pub fn run_ingest(
    provider: Arc<dyn StoreProvider>,
    config: IngestConfig,
) -> Result<IngestReport, PipelineError> {
    let started = Instant::now();
    let totals = Arc::new(IngestTotals::default());

    run_load_phase(Arc::clone(&provider), &config, Arc::clone(&totals))?;
    if !config.dry_run {
        run_transform_phase(provider, &config, Arc::clone(&totals))?;
    }

    let report = totals.report(started.elapsed());
    eprintln!(
        "ingest complete: {} loaded, {} parse errors, {} raw inserted ({} duplicate), \
         {} entries written ({} invalid, {} duplicate) in {:.1}s",
        report.loaded,
        report.parse_errors,
        report.raw_inserted,
        report.raw_deduplicated,
        report.entries_written,
        report.invalid,
        report.duplicates_skipped,
        report.elapsed.as_secs_f64(),
    );
    Ok(report)
}

/// Reprocesses already-loaded raw records through the current cleaner
/// pipeline (phase 2 only). Entries are only ever overwritten, never lost;
/// embeddings survive because the store merge keeps a present embedding.
pub fn run_reprocess(
    provider: Arc<dyn StoreProvider>,
    config: IngestConfig,
) -> Result<IngestReport, PipelineError> {
    let started = Instant::now();
    let totals = Arc::new(IngestTotals::default());
    run_transform_phase(provider, &config, Arc::clone(&totals))?;
    Ok(totals.report(started.elapsed()))
}

fn map_load_error(err: LoadError) -> PipelineError {
    let message = err.to_string();
    match err {
        LoadError::Io { .. } | LoadError::CompressedInput(_) => {
            PipelineError::resource_missing(message)
        }
        LoadError::Record { .. } | LoadError::Format { .. } | LoadError::UnsupportedFormat(_) => {
            PipelineError::invalid(message)
        }
    }
    .in_stage(PIPELINE_NAME, "file-reader")
}

// ---------------------------------------------------------------------------
// Phase 1: file → raw store
// ---------------------------------------------------------------------------

fn run_load_phase(
    provider: Arc<dyn StoreProvider>,
    config: &IngestConfig,
    totals: Arc<IngestTotals>,
) -> Result<(), PipelineError> {
    let control = PipelineControl::new();
    let (raw_tx, raw_rx) = bounded::<Vec<RawRecord>>(config.queue_capacity);

    let reader_counters = StageCounters::new();
    let writer_counters = StageCounters::new();

    let reader_pool = {
        let control = Arc::clone(&control);
        let counters = Arc::clone(&reader_counters);
        let totals = Arc::clone(&totals);
        let config = config.clone();
        let error_window = ErrorWindow::new(config.max_errors_per_minute, Duration::from_secs(60));
        WorkerPool::spawn("file-reader", 1, Arc::clone(&control), move |_worker| {
            let loader = format_loader(&config.format).map_err(map_load_error)?;
            let stream = loader
                .load(&config.file, &config.source_id)
                .map_err(map_load_error)?;

            let mut batch = Vec::with_capacity(config.load_batch);
            for item in stream {
                if control.stop_requested() {
                    break;
                }
                match item {
                    Ok(record) => {
                        totals.loaded.fetch_add(1, Ordering::Relaxed);
                        counters.add_received(1);
                        batch.push(record);
                        if batch.len() >= config.load_batch {
                            let full = std::mem::replace(
                                &mut batch,
                                Vec::with_capacity(config.load_batch),
                            );
                            counters.add_emitted(full.len() as u64);
                            if !send_checked(&raw_tx, full, &control) {
                                break;
                            }
                        }
                    }
                    Err(err) if err.is_record() => {
                        totals.parse_errors.fetch_add(1, Ordering::Relaxed);
                        counters.add_errors(1);
                        debug_log!("skipping record: {err}");
                        if error_window.record() {
                            return Err(PipelineError::fatal(format!(
                                "per-record failure rate exceeded: {err}"
                            ))
                            .in_stage(PIPELINE_NAME, "file-reader"));
                        }
                    }
                    Err(err) => return Err(map_load_error(err)),
                }
            }
            if !batch.is_empty() {
                counters.add_emitted(batch.len() as u64);
                send_checked(&raw_tx, batch, &control);
            }
            Ok(())
        })
    };

    let writer_pool = if config.dry_run {
        // Dry runs count without touching the store.
        let control = Arc::clone(&control);
        WorkerPool::spawn("raw-writer", 1, Arc::clone(&control), move |_worker| {
            while recv_batch(&raw_rx, 1, Duration::from_millis(100), &control).is_some() {}
            Ok(())
        })
    } else {
        let control = Arc::clone(&control);
        let counters = Arc::clone(&writer_counters);
        let totals = Arc::clone(&totals);
        let provider = Arc::clone(&provider);
        let raw_write_batch = config.raw_write_batch.max(1);
        let idle = config.idle_flush;
        WorkerPool::spawn("raw-writer", 1, Arc::clone(&control), move |_worker| {
            let runtime = io_runtime()?;
            runtime.block_on(async {
                let store = provider
                    .raw_store()
                    .await
                    .map_err(|err| err.in_stage(PIPELINE_NAME, "raw-writer"))?;
                let mut batch_id = 0u64;
                while let Some(batches) = recv_batch(&raw_rx, 1, idle, &control) {
                    for records in batches {
                        counters.add_received(records.len() as u64);
                        for chunk in records.chunks(raw_write_batch) {
                            let outcome =
                                write_raw_chunk(store.as_ref(), chunk, batch_id, &control).await?;
                            totals
                                .raw_inserted
                                .fetch_add(outcome.inserted as u64, Ordering::Relaxed);
                            totals
                                .raw_deduplicated
                                .fetch_add(outcome.deduplicated as u64, Ordering::Relaxed);
                            counters.add_emitted(chunk.len() as u64);
                            batch_id += 1;
                        }
                    }
                }
                Ok::<(), PipelineError>(())
            })
        })
    };

    reader_pool.join();
    writer_pool.join();

    match control.take_fatal() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn write_raw_chunk(
    store: &dyn crate::store::RawStore,
    chunk: &[RawRecord],
    batch_id: u64,
    control: &PipelineControl,
) -> Result<crate::store::InsertOutcome, PipelineError> {
    let mut attempt = 0usize;
    loop {
        match store.bulk_insert(chunk).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_retriable() && attempt + 1 < 5 && !control.stop_requested() => {
                attempt += 1;
                let delay = Duration::from_millis(250 * (1 << attempt.min(5) as u32));
                eprintln!("raw write retry {attempt}: {err}; backing off {delay:?}...");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                let first = chunk.first().map(|r| r.checksum.clone()).unwrap_or_default();
                return Err(err
                    .in_stage(PIPELINE_NAME, "raw-writer")
                    .with_batch(batch_id)
                    .with_item(first));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Phase 2: raw store → cleaners → typed store
// ---------------------------------------------------------------------------

struct RawBatch {
    batch_id: u64,
    max_cursor: u64,
    rows: Vec<StoredRaw>,
}

struct CleanedBatch {
    batch_id: u64,
    max_cursor: u64,
    entries: Vec<Entry>,
    logs: Vec<(String, Vec<TransformStep>)>,
}

fn run_transform_phase(
    provider: Arc<dyn StoreProvider>,
    config: &IngestConfig,
    totals: Arc<IngestTotals>,
) -> Result<(), PipelineError> {
    let control = PipelineControl::new();
    let (raw_tx, raw_rx) = bounded::<RawBatch>(config.queue_capacity);
    let (clean_tx, clean_rx) = bounded::<CleanedBatch>(config.queue_capacity);

    let reader_counters = StageCounters::new();
    let cleaner_counters = StageCounters::new();
    let writer_counters = StageCounters::new();

    // Resumed runs start after the last committed cursor and must never
    // checkpoint below it (monotone progress).
    let start_cursor = if config.resume {
        let runtime = io_runtime()?;
        runtime.block_on(async {
            let checkpoints = provider
                .checkpoint_store()
                .await
                .map_err(|err| err.in_stage(PIPELINE_NAME, "raw-reader"))?;
            Ok::<u64, PipelineError>(
                checkpoints
                    .latest(PIPELINE_NAME)
                    .await?
                    .and_then(|checkpoint| {
                        checkpoint.per_source_cursor.get(&config.source_id).copied()
                    })
                    .unwrap_or(0),
            )
        })?
    } else {
        0
    };
    if start_cursor > 0 {
        eprintln!("resuming {} after cursor {start_cursor}...", config.source_id);
    }

    let tracker = Arc::new(CompletionTracker::starting_at(start_cursor));
    let seen_ids: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let last_checkpointed = Arc::new(AtomicU64::new(0));
    let monitor_done = Arc::new(AtomicBool::new(false));

    let mut monitor = ProgressMonitor::new(PIPELINE_NAME, None);
    monitor.track("raw-reader", Arc::clone(&reader_counters), {
        // Receiver clones observe queue depth without keeping the channel
        // open the way a sender clone would.
        let rx = raw_rx.clone();
        Some(Box::new(move || rx.len()))
    });
    monitor.track("cleaner", Arc::clone(&cleaner_counters), {
        let rx = clean_rx.clone();
        Some(Box::new(move || rx.len()))
    });
    monitor.track("typed-writer", Arc::clone(&writer_counters), None);
    let monitor_handle = monitor.spawn(
        Arc::clone(&control),
        Duration::from_secs(5),
        Arc::clone(&monitor_done),
    );

    // Stage 1: raw reader.
    let reader_pool = {
        let control = Arc::clone(&control);
        let counters = Arc::clone(&reader_counters);
        let provider = Arc::clone(&provider);
        let config = config.clone();
        WorkerPool::spawn("raw-reader", 1, Arc::clone(&control), move |_worker| {
            let runtime = io_runtime()?;
            runtime.block_on(async {
                let store = provider
                    .raw_store()
                    .await
                    .map_err(|err| err.in_stage(PIPELINE_NAME, "raw-reader"))?;

                let mut cursor = start_cursor;
                let mut batch_id = 0u64;
                loop {
                    if control.stop_requested() {
                        break;
                    }
                    let rows = store
                        .scan(Some(&config.source_id), cursor, config.clean_batch)
                        .await
                        .map_err(|err| err.in_stage(PIPELINE_NAME, "raw-reader"))?;
                    if rows.is_empty() {
                        break;
                    }
                    cursor = rows.last().map(|row| row.cursor).unwrap_or(cursor);
                    counters.add_received(rows.len() as u64);
                    counters.add_emitted(rows.len() as u64);
                    let batch = RawBatch {
                        batch_id,
                        max_cursor: cursor,
                        rows,
                    };
                    batch_id += 1;
                    if !send_checked(&raw_tx, batch, &control) {
                        break;
                    }
                }
                Ok::<(), PipelineError>(())
            })
        })
    };

    // Stage 2: parallel cleaners.
    let cleaner_pool = {
        let control = Arc::clone(&control);
        let counters = Arc::clone(&cleaner_counters);
        let totals = Arc::clone(&totals);
        let quality_threshold = config.quality_threshold;
        let raw_rx = raw_rx.clone();
        let clean_tx = clean_tx.clone();
        WorkerPool::spawn(
            "cleaner",
            config.cleaner_workers.max(1),
            Arc::clone(&control),
            move |_worker| {
                let pipelines = FieldPipelines::standard();
                let validator = EntryValidator::standard();
                let fingerprint = pipelines.fingerprint();

                while let Some(batches) =
                    recv_batch(&raw_rx, 1, Duration::from_millis(100), &control)
                {
                    for raw_batch in batches {
                        counters.add_received(raw_batch.rows.len() as u64);
                        let mut entries = Vec::with_capacity(raw_batch.rows.len());
                        let mut logs = Vec::with_capacity(raw_batch.rows.len());
                        for stored in &raw_batch.rows {
                            totals.processed.fetch_add(1, Ordering::Relaxed);
                            let (cleaned, steps) = clean_record(
                                &stored.record,
                                &pipelines,
                                &validator,
                                &fingerprint,
                                quality_threshold,
                            );
                            logs.push((stored.record.checksum.clone(), steps));
                            match cleaned {
                                Some(entry) => entries.push(entry),
                                None => {
                                    totals.invalid.fetch_add(1, Ordering::Relaxed);
                                    counters.add_errors(1);
                                }
                            }
                        }
                        counters.add_emitted(entries.len() as u64);
                        let cleaned_batch = CleanedBatch {
                            batch_id: raw_batch.batch_id,
                            max_cursor: raw_batch.max_cursor,
                            entries,
                            logs,
                        };
                        if !send_checked(&clean_tx, cleaned_batch, &control) {
                            return Ok(());
                        }
                    }
                }
                Ok(())
            },
        )
    };
    drop(raw_rx);
    drop(clean_tx);

    // Stage 3: bulk writers.
    let writer_pool = {
        let control = Arc::clone(&control);
        let counters = Arc::clone(&writer_counters);
        let totals = Arc::clone(&totals);
        let provider = Arc::clone(&provider);
        let tracker = Arc::clone(&tracker);
        let seen_ids = Arc::clone(&seen_ids);
        let last_checkpointed = Arc::clone(&last_checkpointed);
        let config = config.clone();
        let clean_rx = clean_rx.clone();
        WorkerPool::spawn("typed-writer", config.writers.max(1), Arc::clone(&control), move |_worker| {
            let runtime = io_runtime()?;
            runtime.block_on(async {
                let entry_store = provider
                    .entry_store()
                    .await
                    .map_err(|err| err.in_stage(PIPELINE_NAME, "typed-writer"))?;
                let transform_log = provider
                    .transform_log()
                    .await
                    .map_err(|err| err.in_stage(PIPELINE_NAME, "typed-writer"))?;
                let checkpoints = provider
                    .checkpoint_store()
                    .await
                    .map_err(|err| err.in_stage(PIPELINE_NAME, "typed-writer"))?;

                while let Some(batches) =
                    recv_batch(&clean_rx, 1, config.idle_flush, &control)
                {
                    for cleaned in batches {
                        counters.add_received(cleaned.entries.len() as u64);

                        let mut to_write = Vec::with_capacity(cleaned.entries.len());
                        {
                            let mut seen = seen_ids.lock().expect("seen ids mutex");
                            for entry in cleaned.entries {
                                if seen.insert(entry.id.clone()) {
                                    to_write.push(entry);
                                } else {
                                    totals.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }

                        for chunk in to_write.chunks(config.write_batch.max(1)) {
                            let written = write_entry_chunk(
                                entry_store.as_ref(),
                                chunk,
                                cleaned.batch_id,
                                &control,
                            )
                            .await?;
                            totals
                                .entries_written
                                .fetch_add(written as u64, Ordering::Relaxed);
                            counters.add_emitted(written as u64);
                        }

                        for (checksum, steps) in &cleaned.logs {
                            transform_log
                                .append(checksum, steps)
                                .await
                                .map_err(|err| err.in_stage(PIPELINE_NAME, "typed-writer"))?;
                        }

                        let committed =
                            tracker.complete(cleaned.batch_id, cleaned.max_cursor);
                        let processed = totals.processed.load(Ordering::Relaxed);
                        let since = processed
                            .saturating_sub(last_checkpointed.load(Ordering::Relaxed));
                        if since >= config.checkpoint_every {
                            last_checkpointed.store(processed, Ordering::Relaxed);
                            save_checkpoint(
                                checkpoints.as_ref(),
                                &config.source_id,
                                committed,
                                &totals,
                            )
                            .await?;
                        }
                    }
                }

                // Final checkpoint covering the full committed prefix.
                save_checkpoint(
                    checkpoints.as_ref(),
                    &config.source_id,
                    tracker.committed_cursor(),
                    &totals,
                )
                .await?;
                Ok::<(), PipelineError>(())
            })
        })
    };
    drop(clean_rx);

    reader_pool.join();
    cleaner_pool.join();
    writer_pool.join();
    monitor_done.store(true, Ordering::Release);
    let _ = monitor_handle.join();

    match control.take_fatal() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn write_entry_chunk(
    store: &dyn crate::store::EntryStore,
    chunk: &[Entry],
    batch_id: u64,
    control: &PipelineControl,
) -> Result<usize, PipelineError> {
    let mut attempt = 0usize;
    loop {
        match store.bulk_upsert(chunk).await {
            Ok(written) => return Ok(written),
            Err(err) if err.is_retriable() && attempt + 1 < 5 && !control.stop_requested() => {
                attempt += 1;
                let delay = Duration::from_millis(250 * (1 << attempt.min(5) as u32));
                eprintln!("entry write retry {attempt}: {err}; backing off {delay:?}...");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                let first = chunk.first().map(|e| e.id.clone()).unwrap_or_default();
                return Err(err
                    .in_stage(PIPELINE_NAME, "typed-writer")
                    .with_batch(batch_id)
                    .with_item(first));
            }
        }
    }
}

async fn save_checkpoint(
    store: &dyn crate::store::CheckpointStore,
    source_id: &str,
    committed_cursor: u64,
    totals: &IngestTotals,
) -> Result<(), PipelineError> {
    let mut per_source_cursor = std::collections::HashMap::new();
    per_source_cursor.insert(source_id.to_string(), committed_cursor);
    let checkpoint = Checkpoint {
        pipeline_name: PIPELINE_NAME.to_string(),
        at_epoch_ms: epoch_ms_now(),
        total: totals.loaded.load(Ordering::Relaxed),
        processed: totals.processed.load(Ordering::Relaxed),
        succeeded: totals.entries_written.load(Ordering::Relaxed),
        failed: totals.invalid.load(Ordering::Relaxed),
        skipped: totals.duplicates_skipped.load(Ordering::Relaxed),
        per_source_cursor,
    };
    store
        .save(&checkpoint)
        .await
        .map_err(|err| err.in_stage(PIPELINE_NAME, "checkpoint"))
}

/// Cleans one raw record into a typed entry, recording transform steps.
/// Returns `None` when the record fails cleaning or the quality gate.
fn clean_record(
    record: &RawRecord,
    pipelines: &FieldPipelines,
    validator: &EntryValidator,
    fingerprint: &str,
    quality_threshold: f64,
) -> (Option<Entry>, Vec<TransformStep>) {
    let mut steps = Vec::new();

    let headword_outcome = pipelines.headword.apply(record.field("headword").unwrap_or(""));
    steps.extend(headword_outcome.steps.iter().cloned());
    if !headword_outcome.ok {
        return (None, steps);
    }

    let raw_ipa = record.field("ipa").unwrap_or("");
    let ipa = if raw_ipa.trim().is_empty() {
        String::new()
    } else {
        let outcome = pipelines.ipa.apply(raw_ipa);
        steps.extend(outcome.steps.iter().cloned());
        // A failed strict IPA pipeline drops the transcription rather than
        // the whole record.
        if outcome.ok {
            outcome.value
        } else {
            String::new()
        }
    };

    let language_outcome = pipelines.language.apply(record.field("language").unwrap_or(""));
    steps.extend(language_outcome.steps.iter().cloned());
    if !language_outcome.ok {
        return (None, steps);
    }

    let definition_outcome = pipelines
        .definition
        .apply(record.field("definition").unwrap_or(""));
    steps.extend(definition_outcome.steps.iter().cloned());

    let etymology = record
        .field("etymology")
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let pos_tag = record
        .field("pos_tag")
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let definition = definition_outcome.value;
    let mut entry = Entry {
        id: entry_id(
            &headword_outcome.value,
            &language_outcome.value,
            primary_gloss(&definition),
        ),
        headword: headword_outcome.value,
        ipa,
        language: language_outcome.value,
        definition,
        etymology,
        pos_tag,
        embedding: None,
        raw_checksum: record.checksum.clone(),
        source_id: record.source_id.clone(),
        pipeline_fingerprint: fingerprint.to_string(),
        quality: 1.0,
        validation_errors: Vec::new(),
        created_at_epoch_ms: epoch_ms_now(),
    };

    let (ok, errors) = validator.validate(&entry);
    if !ok {
        entry.quality = quality_score(errors.len());
        entry.validation_errors = errors;
        if entry.quality < quality_threshold {
            return (None, steps);
        }
    }

    (Some(entry), steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Origin;
    use serde_json::json;

    fn record(payload: serde_json::Value) -> RawRecord {
        RawRecord::new(
            "test",
            payload,
            Origin {
                file_path: "t.jsonl".to_string(),
                line_no: 1,
            },
        )
    }

    fn clean(payload: serde_json::Value) -> (Option<Entry>, Vec<TransformStep>) {
        let pipelines = FieldPipelines::standard();
        let validator = EntryValidator::standard();
        let fingerprint = pipelines.fingerprint();
        clean_record(&record(payload), &pipelines, &validator, &fingerprint, 0.5)
    }

    #[test]
    fn clean_record_produces_typed_entry() {
        let (entry, steps) = clean(json!({
            "headword": "  Father* ",
            "language": "English",
            "ipa": "/ˈfɑːðər/",
            "definition": "male <b>parent</b>",
            "pos_tag": "noun",
        }));
        let entry = entry.expect("entry produced");
        assert_eq!(entry.headword, "Father");
        assert_eq!(entry.language, "en");
        assert_eq!(entry.ipa, "ˈfɑːðər");
        assert_eq!(entry.definition, "male parent");
        assert_eq!(entry.pos_tag.as_deref(), Some("noun"));
        assert_eq!(entry.quality, 1.0);
        assert!(!steps.is_empty());
        assert!(entry.pipeline_fingerprint.contains("headword_stripper"));
    }

    #[test]
    fn empty_headword_is_rejected() {
        let (entry, steps) = clean(json!({
            "headword": "  ",
            "language": "en",
            "definition": "something",
        }));
        assert!(entry.is_none());
        assert!(steps.iter().any(|step| !step.ok));
    }

    #[test]
    fn bad_ipa_drops_transcription_not_record() {
        let (entry, _) = clean(json!({
            "headword": "father",
            "language": "en",
            "ipa": "f@th3r!!",
            "definition": "male parent",
        }));
        let entry = entry.expect("record kept");
        assert_eq!(entry.ipa, "");
    }

    #[test]
    fn low_quality_entries_are_gated() {
        // Unknown language code and a too-short definition stack up
        // validation failures; with a high threshold the record is dropped.
        let pipelines = FieldPipelines::standard();
        let validator = EntryValidator::standard();
        let fingerprint = pipelines.fingerprint();
        let payload = json!({
            "headword": "x",
            "language": "zz",
            "definition": "yy",
        });
        let (kept, _) = clean_record(&record(payload.clone()), &pipelines, &validator, &fingerprint, 0.9);
        assert!(kept.is_none());
        let (kept, _) = clean_record(&record(payload), &pipelines, &validator, &fingerprint, 0.5);
        let entry = kept.expect("kept at lenient threshold");
        assert!(entry.quality < 1.0);
        assert!(!entry.validation_errors.is_empty());
    }

    #[test]
    fn entry_ids_are_stable_across_cleanings() {
        let payload = json!({
            "headword": "Vater",
            "language": "German",
            "definition": "male parent",
        });
        let (first, _) = clean(payload.clone());
        let (second, _) = clean(payload);
        assert_eq!(first.unwrap().id, second.unwrap().id);
    }
}
