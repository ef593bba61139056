//! Write buffer for durable ledger writes.
//!
//! Accepted fingerprints are appended to an in-memory buffer and written to the
//! ledger in batches by [`WriteBuffer::flush`] or a [`BackgroundFlusher`]
//! thread. The buffer holds at most `max_pending` entries; the oldest ones
//! beyond that are dropped and counted as durably unconfirmed.
//!
//! # Locking
//!
//! ```text
//! enqueue ──► pending: Mutex<Vec<LedgerEntry>>  (append, O(1))
//!                   │ swap out under the lock
//! flush ────► flush_lock: Mutex<()> ──► ledger.insert_batch(chunk)  (no pending lock held)
//! ```
//!
//! Appends never wait on the ledger. Only one flush runs at a time. On a
//! failed flush the unwritten entries are put back at the front of the buffer,
//! ahead of anything appended meanwhile.
//!
//! Entries still buffered when the process dies are lost; the fast tier keeps
//! the fingerprints claimed, so the ledger simply misses them.

use crate::models::LedgerEntry;
use crate::storage::DurableLedger;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::instrument;

/// What to do with entries whose flush exhausted all attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedPolicy {
    /// Drop them, counting each as durably unconfirmed.
    #[default]
    Discard,
    /// Keep them at the front of the buffer for the next flush.
    Retain,
}

impl ExhaustedPolicy {
    /// Parses `discard` or `retain` (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discard" => Some(Self::Discard),
            "retain" => Some(Self::Retain),
            _ => None,
        }
    }

    /// Returns the policy name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discard => "discard",
            Self::Retain => "retain",
        }
    }
}

/// Write-buffer settings.
///
/// # Environment Variables
///
/// | Variable | Default |
/// |----------|---------|
/// | `EVENTDEDUP_BATCH_FLUSH_THRESHOLD` | `500` |
/// | `EVENTDEDUP_BATCH_MAX_BATCH_SIZE` | `1000` |
/// | `EVENTDEDUP_BATCH_MAX_ATTEMPTS` | `3` |
/// | `EVENTDEDUP_BATCH_RETRY_BACKOFF_MS` | `100` |
/// | `EVENTDEDUP_BATCH_FLUSH_INTERVAL_MS` | `1000` |
/// | `EVENTDEDUP_BATCH_ON_EXHAUSTED` | `discard` |
/// | `EVENTDEDUP_BATCH_MAX_PENDING` | `100000` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Buffered entry count that triggers a flush.
    pub flush_threshold: usize,
    /// Largest number of entries written in one ledger call.
    pub max_batch_size: usize,
    /// Attempts per chunk before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
    /// Periodic flush interval of the background flusher.
    pub flush_interval: Duration,
    /// Background flusher behavior after exhausted retries.
    pub on_exhausted: ExhaustedPolicy,
    /// Largest backlog kept in memory while the ledger is unreachable.
    pub max_pending: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 500,
            max_batch_size: 1000,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(100),
            flush_interval: Duration::from_secs(1),
            on_exhausted: ExhaustedPolicy::Discard,
            max_pending: 100_000,
        }
    }
}

impl BatchConfig {
    /// Loads the configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies `EVENTDEDUP_BATCH_*` overrides on top of `self`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        use super::config::env_u64;
        if let Some(v) = env_u64("EVENTDEDUP_BATCH_FLUSH_THRESHOLD") {
            self.flush_threshold = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = env_u64("EVENTDEDUP_BATCH_MAX_BATCH_SIZE") {
            self.max_batch_size = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = env_u64("EVENTDEDUP_BATCH_MAX_ATTEMPTS") {
            self.max_attempts = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = env_u64("EVENTDEDUP_BATCH_RETRY_BACKOFF_MS") {
            self.retry_backoff = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("EVENTDEDUP_BATCH_FLUSH_INTERVAL_MS") {
            self.flush_interval = Duration::from_millis(v);
        }
        if let Some(policy) = std::env::var("EVENTDEDUP_BATCH_ON_EXHAUSTED")
            .ok()
            .and_then(|v| ExhaustedPolicy::parse(&v))
        {
            self.on_exhausted = policy;
        }
        if let Some(v) = env_u64("EVENTDEDUP_BATCH_MAX_PENDING") {
            self.max_pending = usize::try_from(v).unwrap_or(usize::MAX);
        }
        self
    }

    /// Builder method to set the flush threshold.
    #[must_use]
    pub const fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    /// Builder method to set the chunk size.
    #[must_use]
    pub const fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Builder method to set the attempts per chunk.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Builder method to set the initial retry backoff.
    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Builder method to set the background flush interval.
    #[must_use]
    pub const fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Builder method to set the exhausted-retries policy.
    #[must_use]
    pub const fn with_on_exhausted(mut self, policy: ExhaustedPolicy) -> Self {
        self.on_exhausted = policy;
        self
    }

    /// Builder method to set the backlog cap.
    #[must_use]
    pub const fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`.
    fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(factor)
    }
}

/// Outcome of a successful flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Entries written to the ledger.
    pub flushed: usize,
    /// Ledger calls that succeeded.
    pub batches: usize,
    /// Retries spent across all chunks.
    pub retries: u32,
}

/// Buffers ledger entries and writes them in retried batches.
pub struct WriteBuffer {
    ledger: Arc<dyn DurableLedger>,
    config: BatchConfig,
    pending: Mutex<Vec<LedgerEntry>>,
    flush_lock: Mutex<()>,
    flushed_total: AtomicU64,
    unconfirmed_total: AtomicU64,
}

impl WriteBuffer {
    /// Creates an empty buffer in front of `ledger`.
    #[must_use]
    pub fn new(ledger: Arc<dyn DurableLedger>, config: BatchConfig) -> Self {
        Self {
            ledger,
            config,
            pending: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            flushed_total: AtomicU64::new(0),
            unconfirmed_total: AtomicU64::new(0),
        }
    }

    /// Returns the buffer configuration.
    #[must_use]
    pub const fn config(&self) -> &BatchConfig {
        &self.config
    }

    fn pending(&self) -> MutexGuard<'_, Vec<LedgerEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an entry without flushing.
    ///
    /// When the buffer is already at `max_pending`, the oldest entries are
    /// dropped to make room and counted as unconfirmed.
    ///
    /// Returns `true` once the buffer has reached the flush threshold.
    pub fn enqueue(&self, entry: LedgerEntry) -> bool {
        let cap = self.config.max_pending.max(1);
        let (reached, overflow) = {
            let mut pending = self.pending();
            pending.push(entry);
            let excess = pending.len().saturating_sub(cap);
            let overflow: Vec<LedgerEntry> = pending.drain(..excess).collect();
            (pending.len() >= self.config.flush_threshold, overflow)
        };
        if !overflow.is_empty() {
            tracing::error!(
                dropped = overflow.len(),
                max_pending = cap,
                "Write buffer full, dropping oldest entries"
            );
            self.record_unconfirmed(&overflow);
        }
        reached
    }

    /// Appends an entry, flushing inline when the threshold is reached.
    ///
    /// Returns the flush report when a flush ran.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FlushFailed`] if the inline flush exhausted its attempts.
    pub fn add(&self, entry: LedgerEntry) -> Result<Option<FlushReport>> {
        if self.enqueue(entry) {
            self.flush().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Entries written since creation.
    #[must_use]
    pub fn flushed_total(&self) -> u64 {
        self.flushed_total.load(Ordering::Relaxed)
    }

    /// Entries dropped without ever reaching the ledger.
    #[must_use]
    pub fn unconfirmed_total(&self) -> u64 {
        self.unconfirmed_total.load(Ordering::Relaxed)
    }

    /// Removes and returns everything buffered, counting it as unconfirmed.
    pub fn discard_pending(&self) -> Vec<LedgerEntry> {
        let dropped = std::mem::take(&mut *self.pending());
        self.record_unconfirmed(&dropped);
        dropped
    }

    /// Writes every buffered entry to the ledger.
    ///
    /// Entries are written in chunks of `max_batch_size`. A failing chunk is
    /// retried with exponential backoff up to `max_attempts`. If it still
    /// fails, that chunk and all later ones go back to the front of the buffer.
    /// Earlier chunks stay written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FlushFailed`] when a chunk exhausts its attempts.
    pub fn flush(&self) -> Result<FlushReport> {
        self.flush_inner(ExhaustedPolicy::Retain)
    }

    /// Flush used by the background flusher, honoring the configured policy.
    ///
    /// Under [`ExhaustedPolicy::Discard`] the unwritten entries are dropped and
    /// [`Error::InconsistentState`] is returned.
    pub(crate) fn flush_with_policy(&self) -> Result<FlushReport> {
        self.flush_inner(self.config.on_exhausted)
    }

    #[instrument(skip(self, policy), fields(operation = "flush", policy = policy.as_str()))]
    fn flush_inner(&self, policy: ExhaustedPolicy) -> Result<FlushReport> {
        let _flushing = self
            .flush_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let drained = std::mem::take(&mut *self.pending());
        if drained.is_empty() {
            return Ok(FlushReport::default());
        }

        let start = Instant::now();
        let chunk_size = self.config.max_batch_size.max(1);
        let mut report = FlushReport::default();

        for (index, chunk) in drained.chunks(chunk_size).enumerate() {
            match self.write_chunk(chunk, &mut report) {
                Ok(()) => {
                    report.flushed += chunk.len();
                    report.batches += 1;
                },
                Err((attempts, cause)) => {
                    self.flushed_total
                        .fetch_add(report.flushed as u64, Ordering::Relaxed);
                    let unwritten = &drained[index * chunk_size..];
                    metrics::counter!("dedup_flush_total", "status" => "failed").increment(1);
                    return Err(self.handle_exhausted(unwritten, policy, attempts, cause, report));
                },
            }
        }

        self.flushed_total
            .fetch_add(report.flushed as u64, Ordering::Relaxed);
        metrics::counter!("dedup_flush_total", "status" => "success").increment(1);
        metrics::histogram!("dedup_flush_duration_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        tracing::debug!(
            flushed = report.flushed,
            batches = report.batches,
            retries = report.retries,
            "Flushed write buffer"
        );
        Ok(report)
    }

    /// Writes one chunk, retrying with backoff. Returns attempts and last cause on exhaustion.
    fn write_chunk(
        &self,
        chunk: &[LedgerEntry],
        report: &mut FlushReport,
    ) -> std::result::Result<(), (u32, String)> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.ledger.insert_batch(chunk) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_attempts => {
                    let delay = self.config.backoff_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        chunk = chunk.len(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Ledger batch write failed, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                    report.retries += 1;
                },
                Err(e) => return Err((attempt, e.to_string())),
            }
        }
    }

    fn handle_exhausted(
        &self,
        unwritten: &[LedgerEntry],
        policy: ExhaustedPolicy,
        attempts: u32,
        cause: String,
        report: FlushReport,
    ) -> Error {
        match policy {
            ExhaustedPolicy::Retain => {
                let pending = {
                    let mut pending = self.pending();
                    let newer = std::mem::take(&mut *pending);
                    pending.reserve(unwritten.len() + newer.len());
                    pending.extend_from_slice(unwritten);
                    pending.extend(newer);
                    pending.len()
                };
                tracing::error!(
                    requeued = unwritten.len(),
                    pending,
                    flushed = report.flushed,
                    attempts,
                    cause = %cause,
                    "Flush exhausted retries, entries requeued"
                );
                Error::FlushFailed {
                    pending,
                    attempts,
                    cause,
                }
            },
            ExhaustedPolicy::Discard => {
                self.record_unconfirmed(unwritten);
                Error::InconsistentState {
                    unconfirmed: unwritten.len(),
                    cause: format!("flush failed after {attempts} attempt(s): {cause}"),
                }
            },
        }
    }

    fn record_unconfirmed(&self, entries: &[LedgerEntry]) {
        if entries.is_empty() {
            return;
        }
        self.unconfirmed_total
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        metrics::counter!("dedup_durable_unconfirmed_total").increment(entries.len() as u64);
        tracing::error!(
            count = entries.len(),
            "Claimed fingerprints dropped before reaching the ledger"
        );
        for entry in entries {
            tracing::warn!(
                fingerprint = %entry.fingerprint,
                event_name = %entry.event_name,
                "Durably unconfirmed fingerprint"
            );
        }
    }
}

enum Signal {
    Flush,
    Shutdown,
}

/// Dedicated thread that flushes a [`WriteBuffer`] on demand and on an interval.
///
/// Stopping the flusher (explicitly or on drop) joins the thread; it does not
/// perform a final flush. Callers flush afterwards.
pub struct BackgroundFlusher {
    signal: SyncSender<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundFlusher {
    /// Spawns the flusher thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the thread cannot be spawned.
    pub fn spawn(buffer: Arc<WriteBuffer>) -> Result<Self> {
        let (signal, receiver) = mpsc::sync_channel::<Signal>(1);
        let interval = buffer.config().flush_interval.max(Duration::from_millis(1));
        let handle = std::thread::Builder::new()
            .name("eventdedup-flusher".to_string())
            .spawn(move || {
                tracing::debug!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "Background flusher started");
                loop {
                    match receiver.recv_timeout(interval) {
                        Ok(Signal::Flush) | Err(RecvTimeoutError::Timeout) => {
                            Self::tick(&buffer);
                        },
                        Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("Background flusher stopped");
            })
            .map_err(|e| Error::failed("spawn_flusher", e))?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    fn tick(buffer: &WriteBuffer) {
        if buffer.is_empty() {
            return;
        }
        match buffer.flush_with_policy() {
            Ok(_) => {},
            Err(e @ Error::FlushFailed { .. }) => {
                tracing::warn!(error = %e, "Background flush failed, will retry next tick");
            },
            Err(e) => tracing::error!(error = %e, "Background flush gave up"),
        }
    }

    /// Requests a flush. Coalesces with any request already queued.
    pub fn notify(&self) {
        match self.signal.try_send(Signal::Flush) {
            Ok(()) | Err(TrySendError::Full(_)) => {},
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("Background flusher is not running");
            },
        }
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown_thread();
    }

    fn shutdown_thread(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.signal.send(Signal::Shutdown);
            if handle.join().is_err() {
                tracing::error!("Background flusher panicked");
            }
        }
    }
}

impl Drop for BackgroundFlusher {
    fn drop(&mut self) {
        self.shutdown_thread();
    }
}
