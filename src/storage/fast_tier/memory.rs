//! In-process fast tier.

use crate::Result;
use crate::models::Fingerprint;
use crate::storage::traits::FastTier;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Map size below which expired records are never swept.
const MIN_SWEEP_THRESHOLD: usize = 1024;

/// Lifetime given to a zero TTL, the same floor Redis `EX` applies.
const MIN_TTL: Duration = Duration::from_secs(1);

/// Lifetime used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn deadline(now: Instant, ttl: Duration) -> Instant {
    let ttl = if ttl.is_zero() { MIN_TTL } else { ttl };
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug)]
struct Records {
    expires: HashMap<String, Instant>,
    sweep_at: usize,
}

impl Records {
    fn is_live(&self, key: &str, now: Instant) -> bool {
        self.expires.get(key).is_some_and(|deadline| *deadline > now)
    }

    /// Drops expired records once the map has doubled since the last sweep.
    fn maybe_sweep(&mut self, now: Instant) {
        if self.expires.len() < self.sweep_at {
            return;
        }
        let before = self.expires.len();
        self.expires.retain(|_, deadline| *deadline > now);
        self.sweep_at = (self.expires.len() * 2).max(MIN_SWEEP_THRESHOLD);
        tracing::debug!(
            removed = before - self.expires.len(),
            remaining = self.expires.len(),
            "Swept expired fast-tier records"
        );
    }
}

/// Fast tier backed by a lock-guarded map of fingerprint to expiry instant.
///
/// `claim` runs its check and insert under one write lock, which is what makes
/// it atomic. Expired records are treated as absent immediately and removed
/// lazily. Sub-second TTLs keep their precision; a zero TTL lasts one second
/// and a TTL too large to represent is capped at a century. There is no capacity bound: evicting a live record early would let
/// a duplicate through.
///
/// Suitable for tests and single-process deployments; state is lost on restart
/// and must be re-warmed from the ledger.
#[derive(Debug)]
pub struct MemoryFastTier {
    records: RwLock<Records>,
}

impl MemoryFastTier {
    /// Creates an empty fast tier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Records {
                expires: HashMap::new(),
                sweep_at: MIN_SWEEP_THRESHOLD,
            }),
        }
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.expires.values().filter(|d| **d > now).count()
    }

    /// Returns true if no live records exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryFastTier {
    fn default() -> Self {
        Self::new()
    }
}

impl FastTier for MemoryFastTier {
    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.is_live(fingerprint.as_str(), Instant::now()))
    }

    fn claim(&self, fingerprint: &Fingerprint, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.is_live(fingerprint.as_str(), now) {
            return Ok(false);
        }
        records.maybe_sweep(now);
        records
            .expires
            .insert(fingerprint.as_str().to_string(), deadline(now, ttl));
        Ok(true)
    }

    fn seed(&self, fingerprints: &[Fingerprint], ttl: Duration) -> Result<usize> {
        let now = Instant::now();
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.maybe_sweep(now);
        let mut created = 0;
        for fingerprint in fingerprints {
            if !records.is_live(fingerprint.as_str(), now) {
                records
                    .expires
                    .insert(fingerprint.as_str().to_string(), deadline(now, ttl));
                created += 1;
            }
        }
        Ok(created)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
