//! Event deduplication.
//!
//! Events are reduced to a fingerprint, claimed in a fast TTL-bounded tier and
//! recorded in a durable ledger through a batching write buffer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      DeduplicationService                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌─────────────────────────┐ │
//! │  │ Canonicalizer│  │ FastTier     │  │ WriteBuffer             │ │
//! │  │              │─►│              │─►│  + BackgroundFlusher    │ │
//! │  │ SHA-256 over │  │ atomic claim │  │                         │ │
//! │  │ name/subject/│  │ (TTL)        │  │ batched, retried writes │ │
//! │  │ UTC instant  │  └──────▲───────┘  └───────────┬─────────────┘ │
//! │  └──────────────┘         │ seed_cache           ▼               │
//! │                           └──────────────── DurableLedger        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use eventdedup::services::deduplication::{DeduplicationService, DeduplicationConfig};
//!
//! let service = DeduplicationService::new(fast_tier, ledger, DeduplicationConfig::from_env());
//! service.start()?;
//!
//! let outcome = service.is_duplicate_and_claim(&event)?;
//! if outcome.is_duplicate() {
//!     tracing::debug!(fingerprint = %outcome.fingerprint, "Skipping duplicate");
//! }
//!
//! service.shutdown()?;
//! ```

mod batcher;
mod canonicalizer;
mod config;
mod service;
mod types;

pub use batcher::{BackgroundFlusher, BatchConfig, ExhaustedPolicy, FlushReport, WriteBuffer};
pub use canonicalizer::{CanonicalEvent, Canonicalizer, format_instant, normalize_occurrence};
pub use config::{DEFAULT_TTL, DEFAULT_WARM_WINDOW, DeduplicationConfig};
pub(crate) use config::{env_bool, env_u64};
pub use service::DeduplicationService;
pub use types::{DedupStats, Deduplicator, SeedReport};
