//! # eventdedup
//!
//! Duplicate suppression for structured event streams.
//!
//! Events arriving through at-least-once delivery, client retries or double
//! submission are reduced to a deterministic fingerprint, claimed atomically in a
//! fast TTL-bounded tier, and recorded in a durable ledger through a batching
//! write buffer. The ledger is also used to re-warm the fast tier after a restart.
//!
//! ## Features
//!
//! - Deterministic canonicalization (name, subject, UTC instant) with SHA-256
//! - Atomic insert-if-absent claims (in-memory or Redis `SET NX EX`)
//! - SQLite ledger with merge-on-insert and store-enforced retention
//! - Batched, retried durable writes on a background flusher
//! - Batch, HTTP and queue ingestion surfaces
//!
//! ## Example
//!
//! ```rust,ignore
//! use eventdedup::{DeduplicationService, DeduplicationConfig, Event, Verdict};
//! use eventdedup::storage::{MemoryFastTier, MemoryLedger};
//! use std::sync::Arc;
//!
//! let service = DeduplicationService::new(
//!     Arc::new(MemoryFastTier::new()),
//!     Arc::new(MemoryLedger::new()),
//!     DeduplicationConfig::default(),
//! );
//!
//! let event = Event::new("purchase", "2024-01-01T10:00:00Z").with_client_id("123");
//! assert_eq!(service.is_duplicate_and_claim(&event)?.verdict, Verdict::Accepted);
//! assert_eq!(service.is_duplicate_and_claim(&event)?.verdict, Verdict::Duplicate);
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod config;
pub mod ingest;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

pub use config::AppConfig;
pub use models::{
    DedupOutcome, Event, Fingerprint, FingerprintScope, LedgerEntry, OccurredAt, Verdict,
};
pub use services::deduplication::{
    Canonicalizer, DedupStats, DeduplicationConfig, DeduplicationService, WriteBuffer,
};
pub use storage::{DurableLedger, FastTier};

/// Error type for deduplication operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When | Retryable |
/// |---------|-------------|-----------|
/// | `MalformedEvent` | Missing/blank name, missing or unparseable occurrence time | no |
/// | `CacheUnavailable` | Fast-tier connection failure, timeout, open circuit | yes |
/// | `LedgerUnavailable` | Ledger connection failure, timeout, open circuit | yes |
/// | `FlushFailed` | Buffered writes could not be persisted after all attempts | yes |
/// | `InconsistentState` | Claimed fingerprints that never reached the ledger | no |
/// | `InvalidInput` | Bad configuration values or CLI arguments | no |
/// | `OperationFailed` | I/O, sinks, queues, config files | no |
/// | `FeatureNotEnabled` | Using a backend that was not compiled in | no |
#[derive(Debug, ThisError)]
pub enum Error {
    /// The event cannot be canonicalized.
    ///
    /// Local to a single event: batches continue past it.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The fast tier could not be reached or timed out.
    #[error("fast tier unavailable during '{operation}': {cause}")]
    CacheUnavailable {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The durable ledger could not be reached or timed out.
    #[error("ledger unavailable during '{operation}': {cause}")]
    LedgerUnavailable {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// A buffered flush exhausted its attempts.
    ///
    /// The unflushed entries are still in the buffer when this is returned.
    #[error("flush failed after {attempts} attempt(s), {pending} entries pending: {cause}")]
    FlushFailed {
        /// Entries still waiting in the buffer.
        pending: usize,
        /// Attempts made for the failing chunk.
        attempts: u32,
        /// The underlying cause.
        cause: String,
    },

    /// Fingerprints were claimed in the fast tier but never durably recorded.
    #[error("inconsistent state: {unconfirmed} claimed fingerprints not durably written: {cause}")]
    InconsistentState {
        /// Number of claimed but unpersisted fingerprints.
        unconfirmed: usize,
        /// The underlying cause.
        cause: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// Feature not enabled (requires feature flag).
    #[error("feature not enabled: {0} (compile with --features {0})")]
    FeatureNotEnabled(String),
}

impl Error {
    /// Returns true when the caller may retry the same operation later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CacheUnavailable { .. } | Self::LedgerUnavailable { .. } | Self::FlushFailed { .. }
        )
    }

    /// Returns true for infrastructure failures (as opposed to bad input).
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::CacheUnavailable { .. } | Self::LedgerUnavailable { .. }
        )
    }

    pub(crate) fn cache(operation: &str, cause: impl std::fmt::Display) -> Self {
        Self::CacheUnavailable {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }

    pub(crate) fn ledger(operation: &str, cause: impl std::fmt::Display) -> Self {
        Self::LedgerUnavailable {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }

    pub(crate) fn failed(operation: &str, cause: impl std::fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for deduplication operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::MalformedEvent("missing event_datetime".to_string());
        assert_eq!(err.to_string(), "malformed event: missing event_datetime");

        let err = Error::cache("claim", "connection refused");
        assert_eq!(
            err.to_string(),
            "fast tier unavailable during 'claim': connection refused"
        );

        let err = Error::FlushFailed {
            pending: 4,
            attempts: 3,
            cause: "disk full".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "flush failed after 3 attempt(s), 4 entries pending: disk full"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::cache("exists", "timeout").is_retryable());
        assert!(Error::ledger("insert_batch", "locked").is_retryable());
        assert!(!Error::MalformedEvent("x".to_string()).is_retryable());
        assert!(
            !Error::InconsistentState {
                unconfirmed: 1,
                cause: "x".to_string()
            }
            .is_retryable()
        );
        assert!(Error::ledger("exists", "x").is_unavailable());
        assert!(
            !Error::FlushFailed {
                pending: 1,
                attempts: 1,
                cause: "x".to_string()
            }
            .is_unavailable()
        );
    }
}
