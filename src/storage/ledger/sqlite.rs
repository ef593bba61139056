//! `SQLite`-based durable ledger.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE event_fingerprints (
//!     fingerprint    TEXT PRIMARY KEY,
//!     user_id        TEXT NOT NULL,
//!     client_id      TEXT NOT NULL,
//!     event_name     TEXT NOT NULL,
//!     event_datetime TEXT NOT NULL,     -- RFC 3339 UTC
//!     event_date     TEXT NOT NULL,     -- YYYY-MM-DD, UTC
//!     inserted_at    INTEGER NOT NULL   -- unix microseconds
//! );
//! ```
//!
//! Re-inserting a fingerprint merges into the existing row; the row with the
//! latest `inserted_at` wins. Rows older than the retention window are filtered
//! from every read and deleted by [`DurableLedger::purge_expired`], which also
//! runs opportunistically after writes.

use super::RetentionPolicy;
use crate::models::{Fingerprint, LedgerEntry};
use crate::services::deduplication::format_instant;
use crate::storage::sqlite::{
    DEFAULT_BUSY_TIMEOUT, acquire_lock, configure_connection, open_connection,
    record_operation_metrics, status_label,
};
use crate::storage::traits::DurableLedger;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::instrument;

/// Minimum spacing between opportunistic purges, in seconds.
const PURGE_INTERVAL_SECS: i64 = 3600;

const UPSERT_SQL: &str = "INSERT INTO event_fingerprints
        (fingerprint, user_id, client_id, event_name, event_datetime, event_date, inserted_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT(fingerprint) DO UPDATE SET
        user_id = excluded.user_id,
        client_id = excluded.client_id,
        event_name = excluded.event_name,
        event_datetime = excluded.event_datetime,
        event_date = excluded.event_date,
        inserted_at = excluded.inserted_at
     WHERE excluded.inserted_at >= event_fingerprints.inserted_at";

/// `SQLite`-based durable ledger.
///
/// # Concurrency Model
///
/// One `Mutex<Connection>` per instance. WAL mode lets other processes read
/// while this one writes; `busy_timeout` turns lock contention into a bounded
/// wait, after which the call fails with [`Error::LedgerUnavailable`].
pub struct SqliteLedger {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    retention: RetentionPolicy,
    last_purge: Mutex<Option<DateTime<Utc>>>,
}

impl SqliteLedger {
    /// Opens (or creates) a ledger at `db_path` with the default busy timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LedgerUnavailable`] if the database cannot be opened or
    /// the schema cannot be created.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use eventdedup::storage::SqliteLedger;
    ///
    /// let ledger = SqliteLedger::open("./eventdedup.db")?;
    /// # Ok::<(), eventdedup::Error>(())
    /// ```
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_timeout(db_path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Opens (or creates) a ledger with an explicit busy timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LedgerUnavailable`] if the database cannot be opened or
    /// the schema cannot be created.
    pub fn open_with_timeout(db_path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let db_path = db_path.into();
        let conn = open_connection(&db_path, busy_timeout)?;
        let ledger = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
            retention: RetentionPolicy::default(),
            last_purge: Mutex::new(None),
        };
        ledger.initialize()?;
        Ok(ledger)
    }

    /// Creates an in-memory ledger (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns [`Error::LedgerUnavailable`] if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::ledger("open", e))?;
        configure_connection(&conn, DEFAULT_BUSY_TIMEOUT)?;
        let ledger = Self {
            conn: Mutex::new(conn),
            db_path: None,
            retention: RetentionPolicy::default(),
            last_purge: Mutex::new(None),
        };
        ledger.initialize()?;
        Ok(ledger)
    }

    /// Sets the retention policy.
    #[must_use]
    pub const fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Returns the stored row for a fingerprint, ignoring retention.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LedgerUnavailable`] if the query fails or the stored row
    /// cannot be decoded.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<LedgerEntry>> {
        let conn = acquire_lock(&self.conn);
        let row = conn
            .query_row(
                "SELECT fingerprint, user_id, client_id, event_name, event_datetime, inserted_at
                 FROM event_fingerprints WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                |row| {
                    Ok(StoredRow {
                        fingerprint: row.get(0)?,
                        user_id: row.get(1)?,
                        client_id: row.get(2)?,
                        event_name: row.get(3)?,
                        event_datetime: row.get(4)?,
                        inserted_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(|e| Error::ledger("get", e))?;
        row.map(StoredRow::into_entry).transpose()
    }

    fn initialize(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS event_fingerprints (
                fingerprint TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                event_name TEXT NOT NULL,
                event_datetime TEXT NOT NULL,
                event_date TEXT NOT NULL,
                inserted_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_event_fingerprints_date
                ON event_fingerprints(event_date, fingerprint);
            CREATE INDEX IF NOT EXISTS idx_event_fingerprints_inserted_at
                ON event_fingerprints(inserted_at);",
        )
        .map_err(|e| Error::ledger("create_schema", e))
    }

    fn insert_rows(&self, entries: &[LedgerEntry]) -> Result<()> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::ledger("begin_transaction", e))?;
        {
            let mut stmt = tx
                .prepare_cached(UPSERT_SQL)
                .map_err(|e| Error::ledger("prepare_insert", e))?;
            for entry in entries {
                stmt.execute(params![
                    entry.fingerprint.as_str(),
                    entry.user_id,
                    entry.client_id,
                    entry.event_name,
                    format_instant(entry.occurred_at),
                    entry.event_date().format("%Y-%m-%d").to_string(),
                    entry.inserted_at.timestamp_micros(),
                ])
                .map_err(|e| Error::ledger("insert", e))?;
            }
        }
        // Dropping an uncommitted transaction rolls it back.
        tx.commit().map_err(|e| Error::ledger("commit_transaction", e))
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "DELETE FROM event_fingerprints WHERE inserted_at < ?1",
            params![cutoff.timestamp_micros()],
        )
        .map_err(|e| Error::ledger("purge_expired", e))
    }

    /// Purges at most once per [`PURGE_INTERVAL_SECS`]. Failures are logged only.
    fn maybe_purge(&self, now: DateTime<Utc>) {
        {
            let mut last = self
                .last_purge
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|at| (now - at).num_seconds() < PURGE_INTERVAL_SECS) {
                return;
            }
            *last = Some(now);
        }
        match self.purge_expired(now) {
            Ok(0) => {},
            Ok(removed) => tracing::debug!(removed, "Purged expired ledger rows"),
            Err(e) => tracing::warn!(error = %e, "Opportunistic ledger purge failed"),
        }
    }
}

/// Raw column values before decoding.
struct StoredRow {
    fingerprint: String,
    user_id: String,
    client_id: String,
    event_name: String,
    event_datetime: String,
    inserted_at: i64,
}

impl StoredRow {
    fn into_entry(self) -> Result<LedgerEntry> {
        let occurred_at = DateTime::parse_from_rfc3339(&self.event_datetime)
            .map_err(|e| Error::ledger("decode_row", e))?
            .with_timezone(&Utc);
        let inserted_at = DateTime::from_timestamp_micros(self.inserted_at).ok_or_else(|| {
            Error::ledger("decode_row", format!("inserted_at out of range: {}", self.inserted_at))
        })?;
        Ok(LedgerEntry {
            fingerprint: Fingerprint::parse(&self.fingerprint)
                .map_err(|e| Error::ledger("decode_row", e))?,
            client_id: self.client_id,
            user_id: self.user_id,
            event_name: self.event_name,
            occurred_at,
            inserted_at,
        })
    }
}

impl DurableLedger for SqliteLedger {
    #[instrument(skip(self), fields(operation = "exists", backend = "sqlite"))]
    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let start = Instant::now();
        let cutoff = self.retention.cutoff(Utc::now());
        let result = {
            let conn = acquire_lock(&self.conn);
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM event_fingerprints
                               WHERE fingerprint = ?1 AND inserted_at >= ?2)",
                params![fingerprint.as_str(), cutoff.timestamp_micros()],
                |row| row.get::<_, bool>(0),
            )
            .map_err(|e| Error::ledger("exists", e))
        };
        record_operation_metrics("sqlite", "exists", start, status_label(&result));
        result
    }

    #[instrument(skip(self, entries), fields(operation = "insert_batch", backend = "sqlite", count = entries.len()))]
    fn insert_batch(&self, entries: &[LedgerEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let result = self.insert_rows(entries);
        record_operation_metrics("sqlite", "insert_batch", start, status_label(&result));
        if result.is_ok() {
            self.maybe_purge(Utc::now());
        }
        result
    }

    #[instrument(skip(self), fields(operation = "recent_fingerprints", backend = "sqlite"))]
    fn recent_fingerprints(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Fingerprint>> {
        let start = Instant::now();
        let since = since.max(self.retention.cutoff(Utc::now()));
        let result = (|| {
            let conn = acquire_lock(&self.conn);
            let mut stmt = conn
                .prepare(
                    "SELECT fingerprint FROM event_fingerprints
                     WHERE inserted_at >= ?1 AND inserted_at <= ?2
                     ORDER BY event_date, fingerprint",
                )
                .map_err(|e| Error::ledger("prepare_recent", e))?;
            let rows = stmt
                .query_map(
                    params![since.timestamp_micros(), until.timestamp_micros()],
                    |row| row.get::<_, String>(0),
                )
                .map_err(|e| Error::ledger("recent_fingerprints", e))?;

            let mut fingerprints = Vec::new();
            for row in rows {
                let raw = row.map_err(|e| Error::ledger("recent_fingerprints", e))?;
                match Fingerprint::parse(&raw) {
                    Ok(fingerprint) => fingerprints.push(fingerprint),
                    Err(e) => tracing::warn!(fingerprint = %raw, error = %e, "Skipping corrupt ledger row"),
                }
            }
            Ok(fingerprints)
        })();
        record_operation_metrics("sqlite", "recent_fingerprints", start, status_label(&result));
        result
    }

    fn count(&self) -> Result<usize> {
        let start = Instant::now();
        let cutoff = self.retention.cutoff(Utc::now());
        let result = {
            let conn = acquire_lock(&self.conn);
            conn.query_row(
                "SELECT COUNT(*) FROM event_fingerprints WHERE inserted_at >= ?1",
                params![cutoff.timestamp_micros()],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|e| Error::ledger("count", e))
            .and_then(|n| usize::try_from(n).map_err(|e| Error::ledger("count", e)))
        };
        record_operation_metrics("sqlite", "count", start, status_label(&result));
        result
    }

    #[instrument(skip(self), fields(operation = "purge_expired", backend = "sqlite"))]
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let start = Instant::now();
        let result = self.purge_before(self.retention.cutoff(now));
        record_operation_metrics("sqlite", "purge_expired", start, status_label(&result));
        result
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
