//! Staged pipeline runtime: bounded queues, worker pools, batching,
//! cancellation, progress, and committed-prefix tracking.
//!
//! Stages are pools of OS threads joined by bounded crossbeam channels.
//! Producers block when a queue is full and consumers when it is empty;
//! end-of-stream is the channel disconnecting after the last sender drops,
//! which every consumer observes exactly once, after draining all items that
//! were queued before it. I/O-bound stages own a current-thread tokio
//! runtime and block on their store futures.

use crate::debug_log;
use crate::errors::PipelineError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// How long a blocked producer waits between cancellation checks.
const SEND_POLL: Duration = Duration::from_millis(100);

/// Shared cancellation flag plus first-fatal-error latch for a pipeline run.
#[derive(Default)]
pub struct PipelineControl {
    stop: AtomicBool,
    fatal: Mutex<Option<PipelineError>>,
}

impl PipelineControl {
    /// Fresh control handle.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether cancellation has been requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Requests a cooperative stop without recording an error.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Latches the first fatal error and requests a stop.
    pub fn abort(&self, err: PipelineError) {
        {
            let mut fatal = self.fatal.lock().expect("fatal mutex");
            if fatal.is_none() {
                *fatal = Some(err);
            }
        }
        self.request_stop();
    }

    /// Takes the latched fatal error, if any.
    pub fn take_fatal(&self) -> Option<PipelineError> {
        self.fatal.lock().expect("fatal mutex").take()
    }
}

/// Relaxed per-stage counters; the monitor reads each once per cycle.
#[derive(Default)]
pub struct StageCounters {
    received: AtomicU64,
    emitted: AtomicU64,
    errors: AtomicU64,
}

impl StageCounters {
    /// Fresh zeroed counters.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records items pulled from the input queue.
    pub fn add_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    /// Records items pushed downstream.
    pub fn add_emitted(&self, n: u64) {
        self.emitted.fetch_add(n, Ordering::Relaxed);
    }

    /// Records per-item failures.
    pub fn add_errors(&self, n: u64) {
        self.errors.fetch_add(n, Ordering::Relaxed);
    }

    /// One consistent read of `(received, emitted, errors)`.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.received.load(Ordering::Relaxed),
            self.emitted.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

/// Pulls up to `max` items, flushing early on an idle timeout, a stop
/// request, or end-of-stream. Returns `None` only when there is nothing
/// left to process (EOS or cancellation with an empty buffer).
pub fn recv_batch<T>(
    rx: &Receiver<T>,
    max: usize,
    idle: Duration,
    control: &PipelineControl,
) -> Option<Vec<T>> {
    let mut batch = Vec::with_capacity(max.min(1024));
    loop {
        if control.stop_requested() {
            return if batch.is_empty() { None } else { Some(batch) };
        }
        match rx.recv_timeout(idle) {
            Ok(item) => {
                batch.push(item);
                if batch.len() >= max {
                    return Some(batch);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !batch.is_empty() {
                    return Some(batch);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return if batch.is_empty() { None } else { Some(batch) };
            }
        }
    }
}

/// Blocking send that keeps checking the cancellation flag. Returns false
/// when the pipeline stopped or the consumer went away; the item is dropped
/// in that case.
pub fn send_checked<T>(tx: &Sender<T>, mut item: T, control: &PipelineControl) -> bool {
    loop {
        if control.stop_requested() {
            return false;
        }
        match tx.send_timeout(item, SEND_POLL) {
            Ok(()) => return true,
            Err(crossbeam_channel::SendTimeoutError::Timeout(returned)) => item = returned,
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// A named pool of stage worker threads.
///
/// A worker returning an error, or panicking, aborts the pipeline through
/// the shared control; panics never cross the thread boundary.
pub struct WorkerPool {
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` threads named `{stage}-{i}` running `work`.
    pub fn spawn<F>(
        stage: &str,
        workers: usize,
        control: Arc<PipelineControl>,
        work: F,
    ) -> Self
    where
        F: Fn(usize) -> Result<(), PipelineError> + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers.max(1) {
            let work = Arc::clone(&work);
            let control = Arc::clone(&control);
            let stage_name = stage.to_string();
            let handle = thread::Builder::new()
                .name(format!("{stage}-{worker_id}"))
                .spawn(move || {
                    debug_log!("{stage_name} worker {worker_id} started");
                    match catch_unwind(AssertUnwindSafe(|| work(worker_id))) {
                        Ok(Ok(())) => {
                            debug_log!("{stage_name} worker {worker_id} finished");
                        }
                        Ok(Err(err)) => control.abort(err),
                        Err(_) => control.abort(PipelineError::fatal(format!(
                            "{stage_name} worker {worker_id} panicked"
                        ))),
                    }
                })
                .expect("failed to spawn stage worker");
            handles.push(handle);
        }
        Self { handles }
    }

    /// Waits for every worker to exit.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Sliding-window error-rate tracker. Exceeding `max_errors` failures within
/// `window` trips the breaker.
pub struct ErrorWindow {
    window: Duration,
    max_errors: usize,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl ErrorWindow {
    /// Tracker allowing up to `max_errors` per `window`.
    pub fn new(max_errors: usize, window: Duration) -> Self {
        Self {
            window,
            max_errors,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Records one failure; returns true when the rate limit is now exceeded.
    pub fn record(&self) -> bool {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().expect("error window mutex");
        timestamps.push_back(now);
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        timestamps.len() > self.max_errors
    }
}

/// Folds out-of-order batch completions into a contiguous committed prefix.
///
/// Writers complete batches in whatever order they finish; the tracker only
/// advances the committed cursor once every earlier batch has completed, so
/// a checkpoint written from it never covers uncommitted work.
#[derive(Default)]
pub struct CompletionTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    next_expected: u64,
    pending: BTreeMap<u64, u64>,
    committed_cursor: u64,
}

impl CompletionTracker {
    /// Fresh tracker expecting batch ids from 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker whose committed cursor starts at `cursor` (resumed runs must
    /// never report a cursor below the checkpoint they resumed from).
    pub fn starting_at(cursor: u64) -> Self {
        let tracker = Self::default();
        tracker
            .inner
            .lock()
            .expect("tracker mutex")
            .committed_cursor = cursor;
        tracker
    }

    /// Marks `batch_id` (with its max source cursor) complete and returns
    /// the cursor covered by the contiguous committed prefix.
    pub fn complete(&self, batch_id: u64, max_cursor: u64) -> u64 {
        let mut inner = self.inner.lock().expect("tracker mutex");
        inner.pending.insert(batch_id, max_cursor);
        loop {
            let next = inner.next_expected;
            let Some(cursor) = inner.pending.remove(&next) else {
                break;
            };
            inner.committed_cursor = inner.committed_cursor.max(cursor);
            inner.next_expected += 1;
        }
        inner.committed_cursor
    }

    /// Cursor covered by completed work so far.
    pub fn committed_cursor(&self) -> u64 {
        self.inner.lock().expect("tracker mutex").committed_cursor
    }
}

/// One stage registered with the progress monitor.
struct MonitoredStage {
    name: String,
    counters: Arc<StageCounters>,
    queue_depth: Option<Box<dyn Fn() -> usize + Send + Sync>>,
}

/// Aggregates per-stage counters and prints rate, queue depths, and ETA at a
/// fixed cadence.
pub struct ProgressMonitor {
    pipeline: String,
    total: Option<u64>,
    stages: Vec<MonitoredStage>,
}

impl ProgressMonitor {
    /// Monitor for one pipeline run; `total` enables ETA output.
    pub fn new(pipeline: impl Into<String>, total: Option<u64>) -> Self {
        Self {
            pipeline: pipeline.into(),
            total,
            stages: Vec::new(),
        }
    }

    /// Registers a stage's counters, optionally with its input-queue probe.
    pub fn track(
        &mut self,
        name: impl Into<String>,
        counters: Arc<StageCounters>,
        queue_depth: Option<Box<dyn Fn() -> usize + Send + Sync>>,
    ) {
        self.stages.push(MonitoredStage {
            name: name.into(),
            counters,
            queue_depth,
        });
    }

    /// Spawns the monitor thread; it exits when `done` is set or the
    /// pipeline stops.
    pub fn spawn(
        self,
        control: Arc<PipelineControl>,
        cadence: Duration,
        done: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name(format!("{}-monitor", self.pipeline))
            .spawn(move || {
                let started = Instant::now();
                loop {
                    if done.load(Ordering::Acquire) || control.stop_requested() {
                        break;
                    }
                    thread::sleep(cadence);
                    self.report(started);
                }
            })
            .expect("failed to spawn progress monitor")
    }

    fn report(&self, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
        let mut line = format!("[{}]", self.pipeline);
        let mut sink_emitted = 0u64;
        for stage in &self.stages {
            let (received, emitted, errors) = stage.counters.snapshot();
            sink_emitted = emitted;
            line.push_str(&format!(" {}={}/{}", stage.name, received, emitted));
            if errors > 0 {
                line.push_str(&format!("(err {errors})"));
            }
            if let Some(depth) = &stage.queue_depth {
                line.push_str(&format!(" q={}", depth()));
            }
        }
        line.push_str(&format!(" rate={:.0}/s", sink_emitted as f64 / elapsed));
        if let Some(total) = self.total {
            let remaining = total.saturating_sub(sink_emitted);
            let rate = sink_emitted as f64 / elapsed;
            if rate > 0.0 {
                line.push_str(&format!(" eta={:.0}s", remaining as f64 / rate));
            }
        }
        eprintln!("{line}");
    }
}

/// Builds the single-threaded runtime an I/O stage worker drives its store
/// futures on.
pub fn io_runtime() -> Result<tokio::runtime::Runtime, PipelineError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| PipelineError::fatal(format!("failed to build stage runtime: {err}")))
}

/// Retries a fallible write with exponential backoff; transient failures are
/// retried up to `attempts` times, anything else propagates immediately.
pub fn retry_with_backoff<T>(
    attempts: usize,
    mut operation: impl FnMut() -> Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    let mut attempt = 0usize;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt + 1 < attempts => {
                attempt += 1;
                let capped = attempt.min(5) as u32;
                let delay = Duration::from_millis(250 * (1 << capped));
                eprintln!("retriable failure (attempt {attempt}/{attempts}): {err}; backing off {delay:?}...");
                thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}
