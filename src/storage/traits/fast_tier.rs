//! Fast-tier existence cache trait.
//!
//! The fast tier answers "has this fingerprint been claimed recently?" with low
//! latency and bounded retention.
//!
//! # Available Implementations
//!
//! | Backend | Use Case | Claim primitive |
//! |---------|----------|-----------------|
//! | `MemoryFastTier` | Single process, tests | Write-locked check-and-insert |
//! | `RedisFastTier` | Shared across processes | `SET key 1 NX EX ttl` |
//!
//! # Claim Atomicity
//!
//! Deduplication correctness rests entirely on [`FastTier::claim`]: for any
//! fingerprint, at most one of N concurrent callers may observe `true` while a
//! record is live. A backend without an atomic insert-if-absent-with-expiry
//! primitive must not implement this trait.
//!
//! # Error Modes
//!
//! Connectivity failures and timeouts surface as
//! [`crate::Error::CacheUnavailable`]. Implementations never translate a failure
//! into `true` or `false`.

use crate::Result;
use crate::models::Fingerprint;
use std::time::Duration;

/// Trait for fast-tier backends.
///
/// # Implementor Notes
///
/// - Methods use `&self` to enable sharing via `Arc<dyn FastTier>`
/// - Records expire on their own; there is no delete operation
/// - `claim` on a live record must be a no-op returning `false`
pub trait FastTier: Send + Sync {
    /// Returns true if a live record exists for the fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::CacheUnavailable`] if the backend cannot answer.
    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool>;

    /// Atomically inserts a record if none is live.
    ///
    /// Returns `true` if this call created the record.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::CacheUnavailable`] if the backend cannot answer.
    fn claim(&self, fingerprint: &Fingerprint, ttl: Duration) -> Result<bool>;

    /// Inserts-if-absent many fingerprints, returning how many were new.
    ///
    /// Used by cache warming. The default claims one at a time.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::CacheUnavailable`] if the backend cannot answer.
    fn seed(&self, fingerprints: &[Fingerprint], ttl: Duration) -> Result<usize> {
        let mut created = 0;
        for fingerprint in fingerprints {
            if self.claim(fingerprint, ttl)? {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Short backend name for logs and metrics.
    fn backend_name(&self) -> &'static str;
}
