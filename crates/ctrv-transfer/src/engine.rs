//! Partitioned parallel transfer
//!
//! Each worker owns `[partition_size * i, min(partition_size * (i + 1), file_size))`,
//! opens its own source and target handles, and copies one buffer at a time.
//! The first error stops every sibling at its next buffer boundary; a stopped
//! transfer (failed or cancelled) deletes its partial target.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, warn};

use ctrv_core::config::TransferConfig;
use ctrv_core::{CtrvError, CtrvResult};
use ctrv_storage::RealFile;

use crate::parts::{read_full, PartSource, PartTarget};

/// Files at or below this size are copied by a single worker
pub const MIN_FILE_SIZE_FOR_PARALLELISM: u64 = 1024 * 1024;

/// Progress callback: `(bytes_so_far, file_size)`. Called from worker
/// threads; calls may arrive out of order but the totals never decrease.
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPlan {
    pub file_size: u64,
    pub partition_size: u64,
    pub partition_count: usize,
}

impl PartitionPlan {
    /// Split `file_size` bytes for `threads` workers. Partition boundaries
    /// are multiples of `minimum_part_size`.
    pub fn new(file_size: u64, threads: usize, minimum_part_size: u64) -> Self {
        let minimum_part_size = minimum_part_size.max(1);
        if threads <= 1 || file_size <= MIN_FILE_SIZE_FOR_PARALLELISM {
            return Self {
                file_size,
                partition_size: file_size,
                partition_count: 1,
            };
        }
        let partition_size = file_size
            .div_ceil(threads as u64)
            .div_ceil(minimum_part_size)
            * minimum_part_size;
        Self {
            file_size,
            partition_size,
            partition_count: file_size.div_ceil(partition_size) as usize,
        }
    }

    pub fn range(&self, index: usize) -> Range<u64> {
        let start = (self.partition_size * index as u64).min(self.file_size);
        let end = start.saturating_add(self.partition_size).min(self.file_size);
        start..end
    }

    pub fn ranges(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        (0..self.partition_count).map(|i| self.range(i))
    }
}

/// One import or export: a source, a target and how to open per-worker
/// handles on them.
pub trait TransferJob: Send + Sync {
    /// Bytes to move, in the units workers read from the source
    fn file_size(&self) -> u64;

    /// Partition boundaries must be multiples of this
    fn minimum_part_size(&self) -> u64;

    /// Runs once on the calling thread before any worker starts.
    fn prepare(&self) -> CtrvResult<()>;

    fn open_source(&self, start: u64) -> CtrvResult<Box<dyn PartSource>>;

    fn open_target(&self, start: u64) -> CtrvResult<Box<dyn PartTarget>>;

    fn target(&self) -> Arc<dyn RealFile>;

    fn source(&self) -> Arc<dyn RealFile>;
}

/// Cooperative cancellation, observed by workers between buffers.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State shared by the workers of one run
struct JobState {
    bytes: AtomicU64,
    failed: AtomicBool,
    first_error: Mutex<Option<CtrvError>>,
}

impl JobState {
    fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            first_error: Mutex::new(None),
        }
    }

    fn fail(&self, err: CtrvError, stop: &StopHandle) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            if let Ok(mut slot) = self.first_error.lock() {
                *slot = Some(err);
            }
        } else {
            debug!(error = %err, "additional worker error after first failure");
        }
        stop.stop();
    }

    fn take_error(&self) -> Option<CtrvError> {
        self.first_error.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Clears the busy flag when a run ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs one transfer at a time on a fixed worker pool.
pub struct TransferEngine {
    pool: rayon::ThreadPool,
    threads: usize,
    buffer_size: usize,
    running: AtomicBool,
    stop: StopHandle,
}

impl TransferEngine {
    /// `threads == 0` uses the available parallelism.
    pub fn new(threads: usize, buffer_size: usize) -> CtrvResult<Self> {
        let threads = if threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            threads
        };
        if buffer_size == 0 {
            return Err(CtrvError::Config("transfer buffer size must be non-zero".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ctrv-transfer-{i}"))
            .build()
            .map_err(|e| CtrvError::Transfer(format!("building worker pool: {e}")))?;
        Ok(Self {
            pool,
            threads,
            buffer_size,
            running: AtomicBool::new(false),
            stop: StopHandle::default(),
        })
    }

    pub fn from_config(config: &TransferConfig) -> CtrvResult<Self> {
        Self::new(config.effective_threads(), config.buffer_size)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Handle for cancelling the current run. Each run clears it on start.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run `job` to completion.
    ///
    /// Returns the target on success, `Ok(None)` when cancelled, or the first
    /// worker error. Any stopped run deletes the partial target; the source is
    /// only deleted after a successful run with `delete_source`.
    pub fn run(
        &self,
        job: &dyn TransferJob,
        delete_source: bool,
        progress: Option<&ProgressFn>,
    ) -> CtrvResult<Option<Arc<dyn RealFile>>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(CtrvError::Transfer("another transfer is already running".into()));
        }
        let _running = RunningGuard(&self.running);
        self.stop.reset();

        let started = Instant::now();
        let file_size = job.file_size();
        let part_size = job.minimum_part_size().max(1);
        let plan = PartitionPlan::new(file_size, self.threads, part_size);
        let buffer_size = aligned_buffer(self.buffer_size, part_size);
        debug!(
            source = %job.source().name(),
            file_size,
            partitions = plan.partition_count,
            partition_size = plan.partition_size,
            buffer_size,
            "starting transfer"
        );

        if let Err(e) = job.prepare() {
            self.discard(job);
            return Err(e);
        }

        let state = JobState::new();
        self.pool.scope(|scope| {
            for (index, range) in plan.ranges().enumerate() {
                let state = &state;
                scope.spawn(move |_| {
                    debug!(part = index, start = range.start, end = range.end, "worker started");
                    let result =
                        self.copy_range(job, range, buffer_size, file_size, state, progress);
                    if let Err(e) = result {
                        warn!(part = index, error = %e, "worker failed");
                        state.fail(e, &self.stop);
                    }
                });
            }
        });

        if self.stop.is_stopped() {
            self.discard(job);
            return match state.take_error() {
                Some(err) => Err(err),
                None if state.failed.load(Ordering::Acquire) => {
                    Err(CtrvError::Transfer("transfer failed".into()))
                }
                None => {
                    warn!(file = %job.target().name(), "transfer cancelled");
                    Ok(None)
                }
            };
        }

        if delete_source {
            let source = job.source();
            source.delete()?;
            debug!(source = %source.name(), "deleted source after transfer");
        }

        let elapsed = started.elapsed();
        let bytes = state.bytes.load(Ordering::Acquire);
        let secs = elapsed.as_secs_f64();
        info!(
            file = %job.target().name(),
            bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            mib_per_sec = if secs > 0.0 { bytes as f64 / secs / (1024.0 * 1024.0) } else { 0.0 },
            "transfer complete"
        );
        Ok(Some(job.target()))
    }

    fn copy_range(
        &self,
        job: &dyn TransferJob,
        range: Range<u64>,
        buffer_size: usize,
        file_size: u64,
        state: &JobState,
        progress: Option<&ProgressFn>,
    ) -> CtrvResult<()> {
        let mut source = job.open_source(range.start)?;
        let mut target = job.open_target(range.start)?;
        let mut buf = vec![0u8; buffer_size];
        let mut position = range.start;

        while position < range.end {
            if self.stop.is_stopped() {
                return Ok(());
            }
            let want = buffer_size.min((range.end - position) as usize);
            let n = read_full(source.as_mut(), &mut buf[..want])?;
            if n == 0 {
                return Err(CtrvError::Transfer(format!(
                    "source ended at {position}, expected {} bytes",
                    range.end
                )));
            }
            target.write_part(&buf[..n])?;
            position += n as u64;

            let total = state.bytes.fetch_add(n as u64, Ordering::AcqRel) + n as u64;
            if let Some(progress) = progress {
                progress(total, file_size);
            }
        }
        target.flush_part()
    }

    fn discard(&self, job: &dyn TransferJob) {
        let target = job.target();
        match target.delete() {
            Ok(_) => debug!(file = %target.name(), "removed partial target"),
            Err(e) => warn!(file = %target.name(), error = %e, "failed to remove partial target"),
        }
    }
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("threads", &self.threads)
            .field("buffer_size", &self.buffer_size)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Round the buffer down to a multiple of `part_size`, never below one part.
fn aligned_buffer(buffer_size: usize, part_size: u64) -> usize {
    let part = part_size as usize;
    (buffer_size / part * part).max(part)
}
