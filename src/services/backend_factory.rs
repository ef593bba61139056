//! Backend factory for storage layer initialization.
//!
//! Turns [`AppConfig`] into concrete store handles and a ready coordinator:
//!
//! ```text
//! BackendFactory
//!   ├── create_fast_tier() → Arc<dyn FastTier>       (memory | redis, circuit breaker)
//!   ├── create_ledger()    → Arc<dyn DurableLedger>  (memory | sqlite, circuit breaker)
//!   └── create_service()   → DeduplicationService
//! ```
//!
//! Unlike a best-effort setup, a store that cannot be opened is an error:
//! running without either tier would silently change deduplication results.

use crate::config::{AppConfig, FastTierBackend, LedgerBackend};
use crate::services::deduplication::DeduplicationService;
use crate::storage::{
    DurableLedger, FastTier, MemoryFastTier, MemoryLedger, RedisFastTier, ResilientFastTier,
    ResilientLedger, SqliteLedger,
};
use crate::Result;
use std::sync::Arc;

/// Factory for creating storage backends.
///
/// # Example
///
/// ```rust
/// use eventdedup::config::{AppConfig, LedgerBackend};
/// use eventdedup::services::BackendFactory;
///
/// let config = AppConfig::default().with_ledger_backend(LedgerBackend::Memory);
/// let service = BackendFactory::create_service(&config).unwrap();
/// assert!(service.is_enabled());
/// ```
pub struct BackendFactory;

impl BackendFactory {
    /// Creates the configured fast tier, wrapped in a circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FeatureNotEnabled`] for Redis without the
    /// `redis` feature, or [`crate::Error::CacheUnavailable`] for a bad URL.
    pub fn create_fast_tier(config: &AppConfig) -> Result<Arc<dyn FastTier>> {
        let tier: Arc<dyn FastTier> = match config.fast_tier.backend {
            FastTierBackend::Memory => Arc::new(ResilientFastTier::new(
                MemoryFastTier::new(),
                &config.resilience,
            )),
            FastTierBackend::Redis => {
                let redis = RedisFastTier::new(&config.fast_tier.url, config.fast_tier.timeout)?;
                Arc::new(ResilientFastTier::new(redis, &config.resilience))
            },
        };
        tracing::debug!(backend = %config.fast_tier.backend, "Created fast tier");
        Ok(tier)
    }

    /// Creates the configured ledger, wrapped in a circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LedgerUnavailable`] if the database cannot be opened.
    pub fn create_ledger(config: &AppConfig) -> Result<Arc<dyn DurableLedger>> {
        let ledger: Arc<dyn DurableLedger> = match config.ledger.backend {
            LedgerBackend::Memory => Arc::new(ResilientLedger::new(
                MemoryLedger::with_retention(config.ledger.retention),
                &config.resilience,
            )),
            LedgerBackend::Sqlite => {
                let sqlite =
                    SqliteLedger::open_with_timeout(&config.ledger.path, config.ledger.busy_timeout)?
                        .with_retention(config.ledger.retention);
                Arc::new(ResilientLedger::new(sqlite, &config.resilience))
            },
        };
        tracing::debug!(
            backend = %config.ledger.backend,
            path = %config.ledger.path.display(),
            retention_days = config.ledger.retention.as_days(),
            "Created ledger"
        );
        Ok(ledger)
    }

    /// Creates both stores and the coordinator that owns them.
    ///
    /// The background flusher is not started.
    ///
    /// # Errors
    ///
    /// Returns any store construction error.
    pub fn create_service(config: &AppConfig) -> Result<DeduplicationService> {
        let fast_tier = Self::create_fast_tier(config)?;
        let ledger = Self::create_ledger(config)?;
        Ok(
            DeduplicationService::new(fast_tier, ledger, config.dedup.clone())
                .with_batch_config(config.batch.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Event;

    #[test]
    fn test_memory_backends() {
        let config = AppConfig::default()
            .with_fast_tier_backend(FastTierBackend::Memory)
            .with_ledger_backend(LedgerBackend::Memory);
        let fast = BackendFactory::create_fast_tier(&config).unwrap();
        assert_eq!(fast.backend_name(), "memory");
        let ledger = BackendFactory::create_ledger(&config).unwrap();
        assert_eq!(ledger.backend_name(), "memory");
    }

    #[test]
    fn test_sqlite_service_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = AppConfig::default().with_ledger_path(dir.path().join("ledger.db"));
        let service = BackendFactory::create_service(&config).unwrap();

        let event = Event::new("purchase", "2024-01-01T10:00:00Z").with_client_id("1");
        assert!(!service.is_duplicate_and_claim(&event).unwrap().is_duplicate());
        assert_eq!(service.flush().unwrap().flushed, 1);
        assert!(dir.path().join("ledger.db").exists());
    }

    #[cfg(not(feature = "redis"))]
    #[test]
    fn test_redis_requires_feature() {
        let config = AppConfig::default().with_fast_tier_backend(FastTierBackend::Redis);
        let err = BackendFactory::create_fast_tier(&config).err().unwrap();
        assert!(matches!(err, crate::Error::FeatureNotEnabled(_)));
    }
}
