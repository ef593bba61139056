//! Durable ledger trait.
//!
//! The ledger is the long-horizon record of accepted fingerprints. It outlives
//! fast-tier records and seeds the fast tier after a restart.
//!
//! # Available Implementations
//!
//! | Backend | Use Case | Merge strategy |
//! |---------|----------|----------------|
//! | `MemoryLedger` | Tests, single process | Map overwrite |
//! | `SqliteLedger` | Default; embedded | `ON CONFLICT DO UPDATE` |
//!
//! # Consistency
//!
//! Inserting the same fingerprint twice must not produce two answers:
//! `exists`, `count` and `recent_fingerprints` see one row per fingerprint.
//! Rows older than the retention window are invisible to reads and removed by
//! [`DurableLedger::purge_expired`].
//!
//! The ledger is written after the fast-tier claim. A write that never lands
//! leaves a fingerprint claimed but unrecorded; callers surface that as
//! [`crate::Error::InconsistentState`] rather than hiding it.

use crate::Result;
use crate::models::{Fingerprint, LedgerEntry};
use chrono::{DateTime, Utc};

/// Trait for durable ledger backends.
pub trait DurableLedger: Send + Sync {
    /// Returns true if the fingerprint is recorded and within retention.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LedgerUnavailable`] if the store cannot answer.
    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool>;

    /// Records a single entry.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LedgerUnavailable`] if the write fails.
    fn insert(&self, entry: &LedgerEntry) -> Result<()> {
        self.insert_batch(std::slice::from_ref(entry))
    }

    /// Records many entries in one round trip. All-or-nothing per call.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LedgerUnavailable`] if the write fails.
    fn insert_batch(&self, entries: &[LedgerEntry]) -> Result<()>;

    /// Returns fingerprints inserted within `[since, until]`, ordered by
    /// occurrence date then fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LedgerUnavailable`] if the query fails.
    fn recent_fingerprints(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Fingerprint>>;

    /// Returns the number of live rows.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LedgerUnavailable`] if the query fails.
    fn count(&self) -> Result<usize>;

    /// Deletes rows inserted before the retention cutoff, returning how many.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LedgerUnavailable`] if the delete fails.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Short backend name for logs and metrics.
    fn backend_name(&self) -> &'static str;
}
