//! Business logic services.
//!
//! Services orchestrate storage backends and provide high-level operations.

mod backend_factory;
pub mod deduplication;

pub use backend_factory::BackendFactory;
pub use deduplication::{
    BatchConfig, DedupStats, DeduplicationConfig, DeduplicationService, Deduplicator, SeedReport,
};
