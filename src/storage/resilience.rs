//! Storage resilience wrappers with circuit breaking.
//!
//! Wraps fast-tier and ledger backends so a dead store fails fast instead of
//! making every caller wait out its timeout.
//!
//! # Circuit Breaker States
//!
//! ```text
//! +--------+     failures >= threshold     +------+
//! | Closed | --------------------------->  | Open |
//! +--------+                               +------+
//!     ^                                        |
//!     |  success                               | timeout elapsed
//!     |                                        v
//!     +--------------------------------  +-----------+
//!                                        | Half-Open |
//!                                        +-----------+
//! ```
//!
//! Only unavailability errors count as failures. A rejected call surfaces as the
//! tier's own unavailable error ([`Error::CacheUnavailable`] or
//! [`Error::LedgerUnavailable`]), never as a verdict.
//!
//! # Usage
//!
//! ```rust,ignore
//! use eventdedup::storage::{RedisFastTier, ResilientFastTier, StorageResilienceConfig};
//!
//! let tier = RedisFastTier::new("redis://localhost:6379", timeout)?;
//! let tier = ResilientFastTier::new(tier, &StorageResilienceConfig::from_env());
//! tier.claim(&fingerprint, ttl)?;
//! ```

use super::traits::{DurableLedger, FastTier};
use crate::models::{Fingerprint, LedgerEntry};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Resilience configuration for storage backends.
#[derive(Debug, Clone)]
pub struct StorageResilienceConfig {
    /// Consecutive failures before opening the circuit.
    pub breaker_failure_threshold: u32,
    /// How long to keep the circuit open before half-open.
    pub breaker_reset_timeout_ms: u64,
    /// Maximum trial calls while half-open.
    pub breaker_half_open_max_calls: u32,
}

impl Default for StorageResilienceConfig {
    fn default() -> Self {
        Self {
            breaker_failure_threshold: 5,
            breaker_reset_timeout_ms: 30_000,
            breaker_half_open_max_calls: 1,
        }
    }
}

impl StorageResilienceConfig {
    /// Loads resilience configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies `EVENTDEDUP_STORAGE_BREAKER_*` overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(parsed) = env_parse::<u32>("EVENTDEDUP_STORAGE_BREAKER_FAILURE_THRESHOLD") {
            self.breaker_failure_threshold = parsed.max(1);
        }
        if let Some(parsed) = env_parse::<u64>("EVENTDEDUP_STORAGE_BREAKER_RESET_MS") {
            self.breaker_reset_timeout_ms = parsed;
        }
        if let Some(parsed) = env_parse::<u32>("EVENTDEDUP_STORAGE_BREAKER_HALF_OPEN_MAX_CALLS") {
            self.breaker_half_open_max_calls = parsed.max(1);
        }
        self
    }

    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.breaker_failure_threshold = threshold;
        self
    }

    /// Sets the reset timeout in milliseconds.
    #[must_use]
    pub const fn with_reset_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.breaker_reset_timeout_ms = timeout_ms;
        self
    }

    /// Sets the half-open max calls.
    #[must_use]
    pub const fn with_half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.breaker_half_open_max_calls = max_calls;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug)]
enum BreakerState {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { attempts: u32 },
}

/// Circuit breaker for storage backends.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
    backend_name: &'static str,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(config: &StorageResilienceConfig, backend_name: &'static str) -> Self {
        Self {
            state: BreakerState::Closed { failures: 0 },
            failure_threshold: config.breaker_failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.breaker_reset_timeout_ms),
            half_open_max_calls: config.breaker_half_open_max_calls.max(1),
            backend_name,
        }
    }

    /// Returns `true` if the request should proceed.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { opened_at } => {
                if opened_at.elapsed() >= self.reset_timeout {
                    tracing::info!(
                        backend = self.backend_name,
                        "Circuit breaker transitioning to half-open"
                    );
                    self.state = BreakerState::HalfOpen { attempts: 0 };
                    true
                } else {
                    false
                }
            },
            BreakerState::HalfOpen { ref mut attempts } => {
                if *attempts >= self.half_open_max_calls {
                    false
                } else {
                    *attempts += 1;
                    true
                }
            },
        }
    }

    /// Records a successful operation, closing the circuit.
    pub fn on_success(&mut self) {
        if !matches!(self.state, BreakerState::Closed { failures: 0 }) {
            tracing::info!(
                backend = self.backend_name,
                "Circuit breaker closing after success"
            );
        }
        self.state = BreakerState::Closed { failures: 0 };
    }

    /// Records a failed operation. Returns `true` if the circuit just opened.
    pub fn on_failure(&mut self) -> bool {
        match self.state {
            BreakerState::Closed { ref mut failures } => {
                *failures += 1;
                if *failures >= self.failure_threshold {
                    tracing::warn!(
                        backend = self.backend_name,
                        failures = *failures,
                        threshold = self.failure_threshold,
                        "Circuit breaker opened after consecutive failures"
                    );
                    self.state = BreakerState::Open {
                        opened_at: Instant::now(),
                    };
                    return true;
                }
            },
            BreakerState::HalfOpen { .. } => {
                tracing::warn!(
                    backend = self.backend_name,
                    "Circuit breaker re-opened after half-open failure"
                );
                self.state = BreakerState::Open {
                    opened_at: Instant::now(),
                };
                return true;
            },
            BreakerState::Open { .. } => {},
        }
        false
    }

    /// Current state for metrics: 0 closed, 1 open, 2 half-open.
    #[must_use]
    pub const fn state_value(&self) -> u8 {
        match self.state {
            BreakerState::Closed { .. } => 0,
            BreakerState::Open { .. } => 1,
            BreakerState::HalfOpen { .. } => 2,
        }
    }

    /// Returns the backend name.
    #[must_use]
    pub const fn backend_name(&self) -> &'static str {
        self.backend_name
    }
}

/// Shared breaker bookkeeping for both wrappers.
struct Guarded {
    breaker: Mutex<CircuitBreaker>,
    backend_name: &'static str,
    tier: &'static str,
    unavailable: fn(&str, String) -> Error,
}

impl Guarded {
    fn execute<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut breaker = self.breaker.lock().unwrap_or_else(PoisonError::into_inner);
        if !breaker.allow() {
            let state = breaker.state_value();
            drop(breaker);
            self.record_metrics(operation, "circuit_open", state);
            return Err((self.unavailable)(
                operation,
                format!("circuit breaker open for backend '{}'", self.backend_name),
            ));
        }
        drop(breaker);

        let result = call();

        let mut breaker = self.breaker.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Err(e) if e.is_unavailable() => {
                let tripped = breaker.on_failure();
                let state = breaker.state_value();
                drop(breaker);
                self.record_metrics(operation, "error", state);
                if tripped {
                    metrics::counter!(
                        "storage_circuit_breaker_trips_total",
                        "tier" => self.tier,
                        "backend" => self.backend_name,
                        "operation" => operation
                    )
                    .increment(1);
                }
            },
            _ => {
                breaker.on_success();
                let state = breaker.state_value();
                drop(breaker);
                self.record_metrics(operation, "success", state);
            },
        }
        result
    }

    fn record_metrics(&self, operation: &'static str, status: &'static str, state: u8) {
        metrics::counter!(
            "storage_requests_total",
            "tier" => self.tier,
            "backend" => self.backend_name,
            "operation" => operation,
            "status" => status
        )
        .increment(1);
        metrics::gauge!(
            "storage_circuit_breaker_state",
            "tier" => self.tier,
            "backend" => self.backend_name
        )
        .set(f64::from(state));
    }

    fn state_value(&self) -> u8 {
        self.breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state_value()
    }
}

fn cache_unavailable(operation: &str, cause: String) -> Error {
    Error::cache(operation, cause)
}

fn ledger_unavailable(operation: &str, cause: String) -> Error {
    Error::ledger(operation, cause)
}

/// Fast tier wrapper with circuit breaker protection.
pub struct ResilientFastTier<F: FastTier> {
    inner: F,
    guard: Guarded,
}

impl<F: FastTier> ResilientFastTier<F> {
    /// Wraps a fast tier.
    #[must_use]
    pub fn new(inner: F, config: &StorageResilienceConfig) -> Self {
        let backend_name = inner.backend_name();
        Self {
            inner,
            guard: Guarded {
                breaker: Mutex::new(CircuitBreaker::new(config, backend_name)),
                backend_name,
                tier: "fast_tier",
                unavailable: cache_unavailable,
            },
        }
    }

    /// Current breaker state: 0 closed, 1 open, 2 half-open.
    #[must_use]
    pub fn breaker_state(&self) -> u8 {
        self.guard.state_value()
    }

    /// Returns the wrapped backend.
    #[must_use]
    pub const fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: FastTier> FastTier for ResilientFastTier<F> {
    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        self.guard
            .execute("exists", || self.inner.exists(fingerprint))
    }

    fn claim(&self, fingerprint: &Fingerprint, ttl: Duration) -> Result<bool> {
        self.guard
            .execute("claim", || self.inner.claim(fingerprint, ttl))
    }

    fn seed(&self, fingerprints: &[Fingerprint], ttl: Duration) -> Result<usize> {
        self.guard
            .execute("seed", || self.inner.seed(fingerprints, ttl))
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }
}

/// Ledger wrapper with circuit breaker protection.
pub struct ResilientLedger<L: DurableLedger> {
    inner: L,
    guard: Guarded,
}

impl<L: DurableLedger> ResilientLedger<L> {
    /// Wraps a ledger.
    #[must_use]
    pub fn new(inner: L, config: &StorageResilienceConfig) -> Self {
        let backend_name = inner.backend_name();
        Self {
            inner,
            guard: Guarded {
                breaker: Mutex::new(CircuitBreaker::new(config, backend_name)),
                backend_name,
                tier: "ledger",
                unavailable: ledger_unavailable,
            },
        }
    }

    /// Current breaker state: 0 closed, 1 open, 2 half-open.
    #[must_use]
    pub fn breaker_state(&self) -> u8 {
        self.guard.state_value()
    }

    /// Returns the wrapped backend.
    #[must_use]
    pub const fn inner(&self) -> &L {
        &self.inner
    }
}

impl<L: DurableLedger> DurableLedger for ResilientLedger<L> {
    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        self.guard
            .execute("exists", || self.inner.exists(fingerprint))
    }

    fn insert(&self, entry: &LedgerEntry) -> Result<()> {
        self.guard.execute("insert", || self.inner.insert(entry))
    }

    fn insert_batch(&self, entries: &[LedgerEntry]) -> Result<()> {
        self.guard
            .execute("insert_batch", || self.inner.insert_batch(entries))
    }

    fn recent_fingerprints(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Fingerprint>> {
        self.guard.execute("recent_fingerprints", || {
            self.inner.recent_fingerprints(since, until)
        })
    }

    fn count(&self) -> Result<usize> {
        self.guard.execute("count", || self.inner.count())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.guard
            .execute("purge_expired", || self.inner.purge_expired(now))
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryFastTier, MemoryLedger};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Fast tier that fails while `down` is set.
    #[derive(Default)]
    struct FlakyTier {
        down: AtomicBool,
        calls: AtomicUsize,
        inner: MemoryFastTier,
    }

    impl FastTier for FlakyTier {
        fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::cache("exists", "connection refused"));
            }
            self.inner.exists(fingerprint)
        }

        fn claim(&self, fingerprint: &Fingerprint, ttl: Duration) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::cache("claim", "connection refused"));
            }
            self.inner.claim(fingerprint, ttl)
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    fn fp() -> Fingerprint {
        Fingerprint::parse(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn test_circuit_breaker_opens_after_threshold_failures() {
        let config = StorageResilienceConfig::default().with_failure_threshold(3);
        let mut breaker = CircuitBreaker::new(&config, "test");

        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state_value(), 0);

        assert!(breaker.on_failure());
        assert_eq!(breaker.state_value(), 1);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_circuit_breaker_half_open_then_close() {
        let config = StorageResilienceConfig::default()
            .with_failure_threshold(1)
            .with_reset_timeout_ms(0);
        let mut breaker = CircuitBreaker::new(&config, "test");

        breaker.on_failure();
        std::thread::sleep(Duration::from_millis(1));
        // The transition call plus `half_open_max_calls` trial calls.
        assert!(breaker.allow());
        assert_eq!(breaker.state_value(), 2);
        assert!(breaker.allow());
        assert!(!breaker.allow());

        breaker.on_success();
        assert_eq!(breaker.state_value(), 0);
    }

    #[test]
    fn test_circuit_breaker_reopens_on_half_open_failure() {
        let config = StorageResilienceConfig::default()
            .with_failure_threshold(1)
            .with_reset_timeout_ms(0);
        let mut breaker = CircuitBreaker::new(&config, "test");

        breaker.on_failure();
        std::thread::sleep(Duration::from_millis(1));
        breaker.allow();
        assert!(breaker.on_failure());
        assert_eq!(breaker.state_value(), 1);
    }

    #[test]
    fn test_config_minimum_values() {
        let config = StorageResilienceConfig {
            breaker_failure_threshold: 0,
            breaker_reset_timeout_ms: 0,
            breaker_half_open_max_calls: 0,
        };
        let breaker = CircuitBreaker::new(&config, "test");
        assert_eq!(breaker.failure_threshold, 1);
        assert_eq!(breaker.half_open_max_calls, 1);
    }

    #[test]
    fn test_open_fast_tier_fails_fast_with_cache_unavailable() {
        let flaky = FlakyTier::default();
        flaky.down.store(true, Ordering::SeqCst);
        let config = StorageResilienceConfig::default()
            .with_failure_threshold(2)
            .with_reset_timeout_ms(60_000);
        let tier = ResilientFastTier::new(flaky, &config);

        let ttl = Duration::from_secs(60);
        assert!(tier.claim(&fp(), ttl).is_err());
        assert!(tier.claim(&fp(), ttl).is_err());
        assert_eq!(tier.breaker_state(), 1);

        let err = tier.claim(&fp(), ttl).unwrap_err();
        assert!(matches!(err, Error::CacheUnavailable { ref cause, .. } if cause.contains("circuit breaker open")));
        // The third call never reached the backend.
        assert_eq!(tier.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fast_tier_recovers_after_reset_timeout() {
        let flaky = FlakyTier::default();
        flaky.down.store(true, Ordering::SeqCst);
        let config = StorageResilienceConfig::default()
            .with_failure_threshold(1)
            .with_reset_timeout_ms(0);
        let tier = ResilientFastTier::new(flaky, &config);

        assert!(tier.exists(&fp()).is_err());
        tier.inner().down.store(false, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(1));

        assert!(tier.claim(&fp(), Duration::from_secs(60)).unwrap());
        assert_eq!(tier.breaker_state(), 0);
    }

    #[test]
    fn test_ledger_wrapper_passes_through() {
        let ledger = ResilientLedger::new(MemoryLedger::new(), &StorageResilienceConfig::default());
        let now = Utc::now();
        let entry = LedgerEntry {
            fingerprint: fp(),
            client_id: "1".to_string(),
            user_id: String::new(),
            event_name: "e".to_string(),
            occurred_at: now,
            inserted_at: now,
        };
        ledger.insert(&entry).unwrap();
        assert!(ledger.exists(&fp()).unwrap());
        assert_eq!(ledger.count().unwrap(), 1);
        assert_eq!(ledger.backend_name(), "memory");
        assert_eq!(ledger.breaker_state(), 0);
    }
}
