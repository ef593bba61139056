//! Data models for eventdedup.
//!
//! This module contains the core data structures exchanged between the
//! canonicalizer, the two storage tiers and the ingestion surfaces.

mod event;
mod fingerprint;
mod ledger;
mod verdict;

pub use event::{Event, OccurredAt, Payload};
pub use fingerprint::{FINGERPRINT_LEN, Fingerprint, FingerprintScope};
pub use ledger::LedgerEntry;
pub use verdict::{DedupOutcome, Verdict};
