//! Deduplication result types.
//!
//! This module defines the counters returned by the coordinator and the
//! [`Deduplicator`] seam used by the ingestion surfaces.

use crate::Result;
use crate::models::{DedupOutcome, Event, Verdict};
use serde::{Deserialize, Serialize};

/// Running counters of a [`super::DeduplicationService`].
///
/// # Example
///
/// ```rust
/// use eventdedup::DedupStats;
///
/// let stats = DedupStats {
///     checked: 3,
///     accepted: 2,
///     duplicates: 1,
///     ..DedupStats::default()
/// };
///
/// assert_eq!(stats.checked, stats.accepted + stats.duplicates);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    /// Events that received a verdict.
    pub checked: u64,
    /// Events accepted as first sightings.
    pub accepted: u64,
    /// Events suppressed as duplicates.
    pub duplicates: u64,
    /// Accepted events turned into duplicates by ledger verification.
    pub ledger_hits: u64,
    /// Ledger entries waiting in the write buffer.
    pub pending_writes: usize,
    /// Entries durably written since start.
    pub flushed: u64,
    /// Claimed fingerprints dropped before reaching the ledger.
    pub unconfirmed: u64,
}

/// Outcome of a cache-warming pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedReport {
    /// Fingerprints read from the ledger.
    pub loaded: usize,
    /// Fingerprints newly inserted into the fast tier.
    pub seeded: usize,
    /// Duration of the pass in milliseconds.
    pub duration_ms: u64,
}

impl SeedReport {
    /// Fingerprints the fast tier already held.
    #[must_use]
    pub const fn already_present(&self) -> usize {
        self.loaded.saturating_sub(self.seeded)
    }
}

/// Trait for deduplication deciders.
///
/// Implemented by [`super::DeduplicationService`]; the ingestion surfaces hold
/// an `Arc<dyn Deduplicator>` so they can be driven by any decider.
pub trait Deduplicator: Send + Sync {
    /// Decides whether `event` is new and claims it if so.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedEvent`] for events that cannot be
    /// fingerprinted, or an unavailable error when a store cannot be reached.
    fn is_duplicate_and_claim(&self, event: &Event) -> Result<DedupOutcome>;

    /// Read-only existence check. Claims nothing.
    ///
    /// # Errors
    ///
    /// Same as [`Deduplicator::is_duplicate_and_claim`].
    fn check(&self, event: &Event) -> Result<Verdict>;

    /// Current counters.
    fn stats(&self) -> DedupStats;
}
