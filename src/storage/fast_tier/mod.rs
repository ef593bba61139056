//! Fast-tier backends.

mod memory;
mod redis;

pub use memory::MemoryFastTier;
pub use self::redis::{DEFAULT_REDIS_TIMEOUT, RedisFastTier};
