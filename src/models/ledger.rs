//! Durable ledger records.

use super::Fingerprint;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One row in the durable ledger.
///
/// Denormalizes the identity attributes so the ledger is useful for analytics
/// without the original payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Event fingerprint (primary key).
    pub fingerprint: Fingerprint,
    /// Client identifier, empty when absent.
    pub client_id: String,
    /// User identifier, empty when absent.
    pub user_id: String,
    /// Event name.
    pub event_name: String,
    /// Normalized occurrence instant.
    pub occurred_at: DateTime<Utc>,
    /// When the entry was created (claim time).
    pub inserted_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Partition date (UTC) of the occurrence.
    #[must_use]
    pub fn event_date(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }
}
