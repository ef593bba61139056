//! Deduplication service orchestrator.
//!
//! Coordinates the canonicalizer, the fast tier, the durable ledger and the
//! write buffer:
//! 1. **Fingerprint**: canonicalize and digest the event (pure)
//! 2. **Claim**: atomic insert-if-absent in the fast tier
//! 3. **Verify** (optional): consult the ledger when the fast tier may have lost state
//! 4. **Record**: enqueue the ledger entry; the caller never waits on the ledger
//!
//! A failed claim is a duplicate. Store errors are never turned into verdicts.

use crate::models::{DedupOutcome, Event, Fingerprint, Verdict};
use crate::storage::{DurableLedger, FastTier};
use crate::{Error, Result};
use chrono::{TimeDelta, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::instrument;

use super::batcher::{BackgroundFlusher, BatchConfig, FlushReport, WriteBuffer};
use super::canonicalizer::Canonicalizer;
use super::config::DeduplicationConfig;
use super::types::{DedupStats, Deduplicator, SeedReport};

/// Service for event deduplication.
///
/// Shared across threads as `Arc<DeduplicationService>`. No global lock is
/// taken on the hot path; the fast tier's atomic claim is what guarantees a
/// single winner per fingerprint.
///
/// # Example
///
/// ```rust
/// use eventdedup::storage::{MemoryFastTier, MemoryLedger};
/// use eventdedup::{DeduplicationConfig, DeduplicationService, Event, Verdict};
/// use std::sync::Arc;
///
/// let service = DeduplicationService::new(
///     Arc::new(MemoryFastTier::new()),
///     Arc::new(MemoryLedger::new()),
///     DeduplicationConfig::default(),
/// );
///
/// let event = Event::new("purchase", "2024-01-01T10:00:00Z").with_client_id("123");
/// assert_eq!(service.is_duplicate_and_claim(&event).unwrap().verdict, Verdict::Accepted);
/// assert_eq!(service.is_duplicate_and_claim(&event).unwrap().verdict, Verdict::Duplicate);
/// ```
pub struct DeduplicationService {
    /// Configuration.
    config: DeduplicationConfig,
    /// Fingerprint computation.
    canonicalizer: Canonicalizer,
    /// Claim store.
    fast_tier: Arc<dyn FastTier>,
    /// Long-horizon record.
    ledger: Arc<dyn DurableLedger>,
    /// Pending ledger writes.
    buffer: Arc<WriteBuffer>,
    /// Background flusher, present between `start` and `shutdown`.
    flusher: Mutex<Option<BackgroundFlusher>>,
    checked: AtomicU64,
    accepted: AtomicU64,
    duplicates: AtomicU64,
    ledger_hits: AtomicU64,
}

impl DeduplicationService {
    /// Creates a service with default write-buffer settings.
    #[must_use]
    pub fn new(
        fast_tier: Arc<dyn FastTier>,
        ledger: Arc<dyn DurableLedger>,
        config: DeduplicationConfig,
    ) -> Self {
        let buffer = Arc::new(WriteBuffer::new(Arc::clone(&ledger), BatchConfig::default()));
        Self {
            canonicalizer: Canonicalizer::new(config.scope),
            config,
            fast_tier,
            ledger,
            buffer,
            flusher: Mutex::new(None),
            checked: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            ledger_hits: AtomicU64::new(0),
        }
    }

    /// Replaces the write-buffer settings. Call before [`Self::start`].
    #[must_use]
    pub fn with_batch_config(mut self, batch: BatchConfig) -> Self {
        self.buffer = Arc::new(WriteBuffer::new(Arc::clone(&self.ledger), batch));
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &DeduplicationConfig {
        &self.config
    }

    /// Returns true if deduplication is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Computes the fingerprint of `event` without touching any store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEvent`] if the event cannot be canonicalized.
    pub fn fingerprint(&self, event: &Event) -> Result<Fingerprint> {
        self.canonicalizer.fingerprint(event)
    }

    /// Decides whether `event` is new and claims its fingerprint if so.
    ///
    /// On a successful claim the ledger entry is enqueued; when the buffer
    /// reaches its threshold the background flusher is signalled. The ledger
    /// is never written on the caller's thread. Without a running flusher
    /// entries wait for [`Self::flush`] or [`Self::shutdown`].
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedEvent`] if the event cannot be canonicalized
    /// - [`Error::CacheUnavailable`] if the claim cannot be made
    #[allow(clippy::cast_possible_truncation)] // Duration in ms won't exceed u64::MAX
    #[instrument(skip(self, event), fields(operation = "dedup_claim", event_name = event.name().unwrap_or_default()))]
    pub fn is_duplicate_and_claim(&self, event: &Event) -> Result<DedupOutcome> {
        let start = Instant::now();
        let canonical = self.canonicalizer.canonicalize(event)?;
        let fingerprint = self.canonicalizer.digest(&canonical);

        if !self.config.enabled {
            tracing::debug!("Deduplication disabled, accepting");
            return Ok(DedupOutcome::accepted(
                fingerprint,
                start.elapsed().as_millis() as u64,
            ));
        }

        if !self.fast_tier.claim(&fingerprint, self.config.ttl)? {
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::debug!(fingerprint = %fingerprint, duration_ms, "Duplicate suppressed");
            self.record_verdict(Verdict::Duplicate, start);
            return Ok(DedupOutcome::duplicate(fingerprint, duration_ms));
        }

        if self.config.ledger_verification && self.seen_in_ledger(&fingerprint) {
            self.ledger_hits.fetch_add(1, Ordering::Relaxed);
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::info!(
                fingerprint = %fingerprint,
                duration_ms,
                "Duplicate found in ledger after fast-tier claim"
            );
            self.record_verdict(Verdict::Duplicate, start);
            return Ok(DedupOutcome::duplicate(fingerprint, duration_ms));
        }

        let entry = canonical.to_ledger_entry(fingerprint.clone(), Utc::now());
        if self.buffer.enqueue(entry) {
            self.request_flush();
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(fingerprint = %fingerprint, duration_ms, "Event accepted");
        self.record_verdict(Verdict::Accepted, start);
        Ok(DedupOutcome::accepted(fingerprint, duration_ms))
    }

    /// Read-only two-tier existence check: fast tier first, then the ledger.
    ///
    /// Claims nothing, so a later [`Self::is_duplicate_and_claim`] for the same
    /// event can still be accepted.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedEvent`] if the event cannot be canonicalized
    /// - [`Error::CacheUnavailable`] / [`Error::LedgerUnavailable`] on store failure
    #[instrument(skip(self, event), fields(operation = "dedup_check"))]
    pub fn check(&self, event: &Event) -> Result<Verdict> {
        let fingerprint = self.canonicalizer.fingerprint(event)?;
        if !self.config.enabled {
            return Ok(Verdict::Accepted);
        }
        if self.fast_tier.exists(&fingerprint)? || self.ledger.exists(&fingerprint)? {
            return Ok(Verdict::Duplicate);
        }
        Ok(Verdict::Accepted)
    }

    /// Seeds the fast tier with fingerprints inserted into the ledger within
    /// the last `window`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if `window` is out of range
    /// - [`Error::LedgerUnavailable`] / [`Error::CacheUnavailable`] on store failure
    #[allow(clippy::cast_possible_truncation)]
    #[instrument(skip(self), fields(operation = "seed_cache", window_secs = window.as_secs()))]
    pub fn seed_cache(&self, window: Duration) -> Result<SeedReport> {
        let start = Instant::now();
        let window = TimeDelta::from_std(window)
            .map_err(|e| Error::InvalidInput(format!("warm window out of range: {e}")))?;
        let until = Utc::now();
        let since = until
            .checked_sub_signed(window)
            .ok_or_else(|| Error::InvalidInput("warm window out of range".to_string()))?;

        let fingerprints = self.ledger.recent_fingerprints(since, until)?;
        let seeded = if fingerprints.is_empty() {
            0
        } else {
            self.fast_tier.seed(&fingerprints, self.config.ttl)?
        };

        let report = SeedReport {
            loaded: fingerprints.len(),
            seeded,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        metrics::counter!("dedup_seeded_total").increment(seeded as u64);
        tracing::info!(
            loaded = report.loaded,
            seeded = report.seeded,
            duration_ms = report.duration_ms,
            "Fast tier warmed from ledger"
        );
        Ok(report)
    }

    /// Flushes pending ledger writes now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FlushFailed`] if the flush exhausted its attempts; the
    /// entries stay buffered.
    pub fn flush(&self) -> Result<FlushReport> {
        self.buffer.flush()
    }

    /// Number of ledger entries waiting in the write buffer.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.buffer.len()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            checked: self.checked.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            ledger_hits: self.ledger_hits.load(Ordering::Relaxed),
            pending_writes: self.buffer.len(),
            flushed: self.buffer.flushed_total(),
            unconfirmed: self.buffer.unconfirmed_total(),
        }
    }

    /// Starts the background flusher. Calling it twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the flusher thread cannot be spawned.
    pub fn start(&self) -> Result<()> {
        let mut flusher = self.flusher.lock().unwrap_or_else(PoisonError::into_inner);
        if flusher.is_none() {
            *flusher = Some(BackgroundFlusher::spawn(Arc::clone(&self.buffer))?);
            tracing::info!(
                backend = self.ledger.backend_name(),
                "Deduplication service started"
            );
        }
        Ok(())
    }

    /// Stops the background flusher and flushes what is left.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InconsistentState`] if the final flush fails; the
    /// remaining entries are dropped and counted as unconfirmed.
    #[instrument(skip(self), fields(operation = "shutdown"))]
    pub fn shutdown(&self) -> Result<FlushReport> {
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(flusher) = flusher {
            flusher.stop();
        }

        match self.buffer.flush() {
            Ok(report) => {
                tracing::info!(flushed = report.flushed, "Deduplication service stopped");
                Ok(report)
            },
            Err(e) => {
                let dropped = self.buffer.discard_pending();
                Err(Error::InconsistentState {
                    unconfirmed: dropped.len(),
                    cause: e.to_string(),
                })
            },
        }
    }

    fn request_flush(&self) {
        let flusher = self.flusher.lock().unwrap_or_else(PoisonError::into_inner);
        match flusher.as_ref() {
            Some(flusher) => flusher.notify(),
            None => tracing::debug!(
                pending = self.buffer.len(),
                "Flush threshold reached without a background flusher"
            ),
        }
    }

    fn seen_in_ledger(&self, fingerprint: &Fingerprint) -> bool {
        match self.ledger.exists(fingerprint) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    fingerprint = %fingerprint,
                    error = %e,
                    "Ledger verification failed, keeping fast-tier verdict"
                );
                false
            },
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_verdict(&self, verdict: Verdict, start: Instant) {
        self.checked.fetch_add(1, Ordering::Relaxed);
        match verdict {
            Verdict::Accepted => self.accepted.fetch_add(1, Ordering::Relaxed),
            Verdict::Duplicate => self.duplicates.fetch_add(1, Ordering::Relaxed),
        };
        metrics::counter!("dedup_checks_total", "verdict" => verdict.as_str()).increment(1);
        metrics::histogram!("dedup_check_duration_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);
    }
}

impl Deduplicator for DeduplicationService {
    fn is_duplicate_and_claim(&self, event: &Event) -> Result<DedupOutcome> {
        Self::is_duplicate_and_claim(self, event)
    }

    fn check(&self, event: &Event) -> Result<Verdict> {
        Self::check(self, event)
    }

    fn stats(&self) -> DedupStats {
        Self::stats(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FingerprintScope, LedgerEntry};
    use crate::services::deduplication::ExhaustedPolicy;
    use crate::storage::{MemoryFastTier, MemoryLedger};
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;

    fn service() -> (Arc<MemoryFastTier>, Arc<MemoryLedger>, DeduplicationService) {
        let fast = Arc::new(MemoryFastTier::new());
        let ledger = Arc::new(MemoryLedger::new());
        let service = DeduplicationService::new(
            fast.clone(),
            ledger.clone(),
            DeduplicationConfig::default(),
        );
        (fast, ledger, service)
    }

    fn purchase(client: &str) -> Event {
        Event::new("purchase", "2024-01-01T10:00:00Z").with_client_id(client)
    }

    /// Ledger whose first `failures` batch writes fail, each after `delay`.
    struct FailingLedger {
        inner: MemoryLedger,
        failures: AtomicUsize,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FailingLedger {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryLedger::new(),
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl DurableLedger for FailingLedger {
        fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
            self.inner.exists(fingerprint)
        }

        fn insert_batch(&self, entries: &[LedgerEntry]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::ledger("insert_batch", "database is locked"));
            }
            self.inner.insert_batch(entries)
        }

        fn recent_fingerprints(
            &self,
            since: chrono::DateTime<Utc>,
            until: chrono::DateTime<Utc>,
        ) -> Result<Vec<Fingerprint>> {
            self.inner.recent_fingerprints(since, until)
        }

        fn count(&self) -> Result<usize> {
            self.inner.count()
        }

        fn purge_expired(&self, now: chrono::DateTime<Utc>) -> Result<usize> {
            self.inner.purge_expired(now)
        }

        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    /// Fast tier that is always down.
    struct DownFastTier;

    impl FastTier for DownFastTier {
        fn exists(&self, _: &Fingerprint) -> Result<bool> {
            Err(Error::cache("exists", "connection refused"))
        }
        fn claim(&self, _: &Fingerprint, _: Duration) -> Result<bool> {
            Err(Error::cache("claim", "connection refused"))
        }
        fn backend_name(&self) -> &'static str {
            "down"
        }
    }

    #[test]
    fn test_purchase_scenario() {
        let (_, _, service) = service();

        let verdicts: Vec<Verdict> = [purchase("123"), purchase("123"), purchase("456")]
            .iter()
            .map(|e| service.is_duplicate_and_claim(e).unwrap().verdict)
            .collect();

        assert_eq!(
            verdicts,
            vec![Verdict::Accepted, Verdict::Duplicate, Verdict::Accepted]
        );
        let stats = service.stats();
        assert_eq!(stats.checked, 3);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.pending_writes, 2);
    }

    #[test]
    fn test_accepted_events_reach_ledger_on_flush() {
        let (_, ledger, service) = service();
        let outcome = service.is_duplicate_and_claim(&purchase("123")).unwrap();
        assert_eq!(ledger.count().unwrap(), 0);

        let report = service.flush().unwrap();
        assert_eq!(report.flushed, 1);
        let stored: LedgerEntry = ledger.get(&outcome.fingerprint).unwrap();
        assert_eq!(stored.client_id, "123");
        assert_eq!(stored.event_name, "purchase");
    }

    #[test]
    fn test_claim_never_writes_ledger_without_flusher() {
        let ledger = Arc::new(FailingLedger::new(usize::MAX).with_delay(Duration::from_millis(200)));
        let service = DeduplicationService::new(
            Arc::new(MemoryFastTier::new()),
            ledger.clone(),
            DeduplicationConfig::default(),
        )
        .with_batch_config(
            BatchConfig::default()
                .with_flush_threshold(1)
                .with_retry_backoff(Duration::from_millis(100)),
        );

        let start = Instant::now();
        for client in ["1", "2", "3"] {
            let outcome = service.is_duplicate_and_claim(&purchase(client)).unwrap();
            assert_eq!(outcome.verdict, Verdict::Accepted);
        }
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.pending_writes(), 3);
    }

    #[test]
    fn test_threshold_signals_running_flusher() {
        let (_, ledger, service) = service();
        let service = service.with_batch_config(
            BatchConfig::default()
                .with_flush_threshold(2)
                .with_flush_interval(Duration::from_secs(3600)),
        );
        service.start().unwrap();
        service.is_duplicate_and_claim(&purchase("1")).unwrap();
        service.is_duplicate_and_claim(&purchase("2")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ledger.count().unwrap() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ledger.count().unwrap(), 2);
        service.shutdown().unwrap();
    }

    #[test]
    fn test_backlog_is_capped_while_ledger_is_down() {
        let ledger = Arc::new(FailingLedger::new(usize::MAX));
        let service = DeduplicationService::new(
            Arc::new(MemoryFastTier::new()),
            ledger,
            DeduplicationConfig::default(),
        )
        .with_batch_config(BatchConfig::default().with_max_pending(2));

        for client in ["1", "2", "3", "4"] {
            service.is_duplicate_and_claim(&purchase(client)).unwrap();
        }
        let stats = service.stats();
        assert_eq!(stats.pending_writes, 2);
        assert_eq!(stats.unconfirmed, 2);
    }

    #[test]
    fn test_shutdown_with_failing_ledger_is_inconsistent() {
        let ledger = Arc::new(FailingLedger::new(usize::MAX));
        let service = DeduplicationService::new(
            Arc::new(MemoryFastTier::new()),
            ledger,
            DeduplicationConfig::default(),
        )
        .with_batch_config(
            BatchConfig::default()
                .with_max_attempts(2)
                .with_retry_backoff(Duration::from_millis(1)),
        );
        service.is_duplicate_and_claim(&purchase("1")).unwrap();
        service.is_duplicate_and_claim(&purchase("2")).unwrap();

        let err = service.shutdown().unwrap_err();
        assert!(matches!(err, Error::InconsistentState { unconfirmed: 2, .. }));
        assert_eq!(service.pending_writes(), 0);
        assert_eq!(service.stats().unconfirmed, 2);
    }

    #[test]
    fn test_background_discard_counts_unconfirmed() {
        let ledger = Arc::new(FailingLedger::new(usize::MAX));
        let service = DeduplicationService::new(
            Arc::new(MemoryFastTier::new()),
            ledger.clone(),
            DeduplicationConfig::default(),
        )
        .with_batch_config(
            BatchConfig::default()
                .with_max_attempts(1)
                .with_flush_interval(Duration::from_millis(10))
                .with_on_exhausted(ExhaustedPolicy::Discard),
        );
        service.start().unwrap();
        service.is_duplicate_and_claim(&purchase("1")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while service.stats().unconfirmed == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(service.stats().unconfirmed, 1);
        assert_eq!(service.pending_writes(), 0);
        assert!(ledger.calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(service.shutdown().unwrap().flushed, 0);
    }

    #[test]
    fn test_malformed_event_is_rejected() {
        let (_, _, service) = service();
        let err = service
            .is_duplicate_and_claim(&Event::new("", "2024-01-01T10:00:00Z"))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedEvent(_)));
        assert_eq!(service.stats().checked, 0);
    }

    #[test]
    fn test_cache_unavailable_is_not_a_verdict() {
        let service = DeduplicationService::new(
            Arc::new(DownFastTier),
            Arc::new(MemoryLedger::new()),
            DeduplicationConfig::default(),
        );
        let err = service.is_duplicate_and_claim(&purchase("1")).unwrap_err();
        assert!(matches!(err, Error::CacheUnavailable { .. }));
        assert!(err.is_retryable());
        assert_eq!(service.pending_writes(), 0);
    }

    #[test]
    fn test_disabled_accepts_everything() {
        let fast = Arc::new(MemoryFastTier::new());
        let service = DeduplicationService::new(
            fast.clone(),
            Arc::new(MemoryLedger::new()),
            DeduplicationConfig::default().with_enabled(false),
        );
        for _ in 0..3 {
            assert_eq!(
                service.is_duplicate_and_claim(&purchase("1")).unwrap().verdict,
                Verdict::Accepted
            );
        }
        assert!(fast.is_empty());
        assert_eq!(service.pending_writes(), 0);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let (_, _, service) = service();
        let service = Arc::new(service);
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let service = Arc::clone(&service);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    service.is_duplicate_and_claim(&purchase("race")).unwrap().verdict
                })
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|v| *v == Verdict::Accepted)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(service.pending_writes(), 1);
    }

    #[test]
    fn test_ledger_verification_catches_lost_fast_tier() {
        let ledger = Arc::new(MemoryLedger::new());
        let first = DeduplicationService::new(
            Arc::new(MemoryFastTier::new()),
            ledger.clone(),
            DeduplicationConfig::default(),
        );
        first.is_duplicate_and_claim(&purchase("1")).unwrap();
        first.flush().unwrap();

        // Fresh fast tier, as after a restart without warming.
        let second = DeduplicationService::new(
            Arc::new(MemoryFastTier::new()),
            ledger,
            DeduplicationConfig::default().with_ledger_verification(true),
        );
        let outcome = second.is_duplicate_and_claim(&purchase("1")).unwrap();
        assert_eq!(outcome.verdict, Verdict::Duplicate);
        assert_eq!(second.stats().ledger_hits, 1);
        assert_eq!(second.pending_writes(), 0);
    }

    #[test]
    fn test_check_is_read_only() {
        let (_, _, service) = service();
        assert_eq!(service.check(&purchase("1")).unwrap(), Verdict::Accepted);
        assert_eq!(service.check(&purchase("1")).unwrap(), Verdict::Accepted);
        assert_eq!(
            service.is_duplicate_and_claim(&purchase("1")).unwrap().verdict,
            Verdict::Accepted
        );
        assert_eq!(service.check(&purchase("1")).unwrap(), Verdict::Duplicate);
    }

    #[test]
    fn test_check_falls_back_to_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let first = DeduplicationService::new(
            Arc::new(MemoryFastTier::new()),
            ledger.clone(),
            DeduplicationConfig::default(),
        );
        first.is_duplicate_and_claim(&purchase("1")).unwrap();
        first.flush().unwrap();

        let second = DeduplicationService::new(
            Arc::new(MemoryFastTier::new()),
            ledger,
            DeduplicationConfig::default(),
        );
        assert_eq!(second.check(&purchase("1")).unwrap(), Verdict::Duplicate);
    }

    #[test]
    fn test_seed_cache_restores_claims() {
        let ledger = Arc::new(MemoryLedger::new());
        let first = DeduplicationService::new(
            Arc::new(MemoryFastTier::new()),
            ledger.clone(),
            DeduplicationConfig::default(),
        );
        first.is_duplicate_and_claim(&purchase("1")).unwrap();
        first.is_duplicate_and_claim(&purchase("2")).unwrap();
        first.flush().unwrap();

        let fast = Arc::new(MemoryFastTier::new());
        let second = DeduplicationService::new(
            fast.clone(),
            ledger,
            DeduplicationConfig::default(),
        );
        let report = second.seed_cache(Duration::from_secs(3600)).unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(report.seeded, 2);
        assert_eq!(fast.len(), 2);

        assert_eq!(
            second.is_duplicate_and_claim(&purchase("1")).unwrap().verdict,
            Verdict::Duplicate
        );

        let again = second.seed_cache(Duration::from_secs(3600)).unwrap();
        assert_eq!(again.seeded, 0);
        assert_eq!(again.already_present(), 2);
    }

    #[test]
    fn test_start_and_shutdown_flushes() {
        let (_, ledger, service) = service();
        service.start().unwrap();
        service.start().unwrap();
        service.is_duplicate_and_claim(&purchase("1")).unwrap();

        let report = service.shutdown().unwrap();
        assert!(service.pending_writes() == 0);
        assert_eq!(ledger.count().unwrap(), 1);
        assert!(report.flushed <= 1);
    }

    #[test]
    fn test_full_payload_scope_distinguishes_payloads() {
        let service = DeduplicationService::new(
            Arc::new(MemoryFastTier::new()),
            Arc::new(MemoryLedger::new()),
            DeduplicationConfig::default().with_scope(FingerprintScope::FullPayload),
        );
        let a = purchase("1").with_attribute("amount", 10);
        let b = purchase("1").with_attribute("amount", 20);
        assert_eq!(
            service.is_duplicate_and_claim(&a).unwrap().verdict,
            Verdict::Accepted
        );
        assert_eq!(
            service.is_duplicate_and_claim(&b).unwrap().verdict,
            Verdict::Accepted
        );
    }
}
