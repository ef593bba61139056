//! Storage layer abstraction.
//!
//! Two tiers back the deduplication service:
//! - **Fast tier**: TTL-bounded existence cache with an atomic claim (memory, Redis)
//! - **Durable ledger**: long-horizon record of accepted fingerprints (memory, `SQLite`)
//!
//! Both are reached through `Send + Sync` traits so the coordinator can hold
//! them as `Arc<dyn FastTier>` / `Arc<dyn DurableLedger>`. Either can be wrapped
//! in a circuit breaker from [`resilience`].

// Dropping database connections slightly early provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]

pub mod fast_tier;
pub mod ledger;
pub mod resilience;
pub mod sqlite;
pub mod traits;

pub use fast_tier::{DEFAULT_REDIS_TIMEOUT, MemoryFastTier, RedisFastTier};
pub use ledger::{MemoryLedger, RetentionPolicy, SqliteLedger};
pub use resilience::{ResilientFastTier, ResilientLedger, StorageResilienceConfig};
pub use traits::{DurableLedger, FastTier};
