//! In-process durable ledger.
//!
//! "Durable" only for the lifetime of the process; useful in tests and for
//! single-process deployments that accept losing history on restart.

use super::RetentionPolicy;
use crate::Result;
use crate::models::{Fingerprint, LedgerEntry};
use crate::storage::traits::DurableLedger;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// Ledger backed by an ordered map keyed by fingerprint.
///
/// Duplicate inserts keep the row with the latest `inserted_at`.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    rows: RwLock<BTreeMap<Fingerprint, LedgerEntry>>,
    retention: RetentionPolicy,
}

impl MemoryLedger {
    /// Creates an empty ledger with the default retention.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty ledger with the given retention.
    #[must_use]
    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            rows: RwLock::default(),
            retention,
        }
    }

    /// Returns a copy of the stored row, ignoring retention.
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<LedgerEntry> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
    }
}

impl DurableLedger for MemoryLedger {
    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let cutoff = self.retention.cutoff(Utc::now());
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .get(fingerprint)
            .is_some_and(|row| row.inserted_at >= cutoff))
    }

    fn insert_batch(&self, entries: &[LedgerEntry]) -> Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        for entry in entries {
            let newer = rows
                .get(&entry.fingerprint)
                .is_none_or(|existing| entry.inserted_at >= existing.inserted_at);
            if newer {
                rows.insert(entry.fingerprint.clone(), entry.clone());
            }
        }
        Ok(())
    }

    fn recent_fingerprints(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Fingerprint>> {
        let since = since.max(self.retention.cutoff(Utc::now()));
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<&LedgerEntry> = rows
            .values()
            .filter(|row| row.inserted_at >= since && row.inserted_at <= until)
            .collect();
        matched.sort_by(|a, b| {
            a.event_date()
                .cmp(&b.event_date())
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        Ok(matched.into_iter().map(|row| row.fingerprint.clone()).collect())
    }

    fn count(&self) -> Result<usize> {
        let cutoff = self.retention.cutoff(Utc::now());
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.values().filter(|row| row.inserted_at >= cutoff).count())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = self.retention.cutoff(now);
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|_, row| row.inserted_at >= cutoff);
        Ok(before - rows.len())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
