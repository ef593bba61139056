//! Deduplication configuration.
//!
//! Coordinator-level settings: kill switch, fingerprint scope, fast-tier TTL,
//! ledger verification and cache warming. Write-buffer settings live in
//! [`super::BatchConfig`].

use crate::models::FingerprintScope;
use std::time::Duration;

/// Default fast-tier record lifetime (7 days).
pub const DEFAULT_TTL: Duration = Duration::from_secs(604_800);

/// Default cache-warming window (1 day).
pub const DEFAULT_WARM_WINDOW: Duration = Duration::from_secs(86_400);

/// Configuration for the deduplication service.
///
/// # Environment Variables
///
/// | Variable | Type | Default | Description |
/// |----------|------|---------|-------------|
/// | `EVENTDEDUP_DEDUP_ENABLED` | bool | `true` | Kill switch; `false` accepts everything |
/// | `EVENTDEDUP_DEDUP_SCOPE` | string | `identity_time` | `identity_time` or `full_payload` |
/// | `EVENTDEDUP_FAST_TIER_TTL_SECS` | u64 | `604800` | Fast-tier record lifetime |
/// | `EVENTDEDUP_DEDUP_LEDGER_VERIFICATION` | bool | `false` | Consult the ledger after a successful claim |
/// | `EVENTDEDUP_DEDUP_WARM_WINDOW_SECS` | u64 | `86400` | How far back cache warming looks |
/// | `EVENTDEDUP_DEDUP_WARM_ON_STARTUP` | bool | `true` | Warm the fast tier when the service starts |
///
/// # Example
///
/// ```rust
/// use eventdedup::DeduplicationConfig;
/// use eventdedup::FingerprintScope;
/// use std::time::Duration;
///
/// let config = DeduplicationConfig::default();
/// assert!(config.enabled);
/// assert_eq!(config.scope, FingerprintScope::IdentityTime);
/// assert_eq!(config.ttl, Duration::from_secs(604_800));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeduplicationConfig {
    /// Enable/disable deduplication entirely.
    pub enabled: bool,

    /// Which event fields feed the fingerprint.
    pub scope: FingerprintScope,

    /// Fast-tier record lifetime. Also used when seeding.
    pub ttl: Duration,

    /// After a successful claim, treat a fingerprint already in the ledger as a
    /// duplicate. Costs one ledger read per accepted event.
    pub ledger_verification: bool,

    /// Window of ledger history loaded into the fast tier by cache warming.
    pub warm_window: Duration,

    /// Whether the runtime warms the fast tier on startup.
    pub warm_on_startup: bool,
}

impl DeduplicationConfig {
    /// Creates a new configuration from environment variables.
    ///
    /// Falls back to defaults for any unset or unparseable variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies `EVENTDEDUP_*` overrides on top of `self`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_bool("EVENTDEDUP_DEDUP_ENABLED") {
            self.enabled = v;
        }
        if let Some(scope) = std::env::var("EVENTDEDUP_DEDUP_SCOPE")
            .ok()
            .and_then(|v| FingerprintScope::parse(&v))
        {
            self.scope = scope;
        }
        if let Some(secs) = env_u64("EVENTDEDUP_FAST_TIER_TTL_SECS") {
            self.ttl = Duration::from_secs(secs);
        }
        if let Some(v) = env_bool("EVENTDEDUP_DEDUP_LEDGER_VERIFICATION") {
            self.ledger_verification = v;
        }
        if let Some(secs) = env_u64("EVENTDEDUP_DEDUP_WARM_WINDOW_SECS") {
            self.warm_window = Duration::from_secs(secs);
        }
        if let Some(v) = env_bool("EVENTDEDUP_DEDUP_WARM_ON_STARTUP") {
            self.warm_on_startup = v;
        }
        self
    }

    /// Builder method to set enabled state.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Builder method to set the fingerprint scope.
    #[must_use]
    pub const fn with_scope(mut self, scope: FingerprintScope) -> Self {
        self.scope = scope;
        self
    }

    /// Builder method to set the fast-tier TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Builder method to toggle ledger verification.
    #[must_use]
    pub const fn with_ledger_verification(mut self, enabled: bool) -> Self {
        self.ledger_verification = enabled;
        self
    }

    /// Builder method to set the cache-warming window.
    #[must_use]
    pub const fn with_warm_window(mut self, window: Duration) -> Self {
        self.warm_window = window;
        self
    }

    /// Builder method to toggle warming on startup.
    #[must_use]
    pub const fn with_warm_on_startup(mut self, warm: bool) -> Self {
        self.warm_on_startup = warm;
        self
    }
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scope: FingerprintScope::IdentityTime,
            ttl: DEFAULT_TTL,
            ledger_verification: false,
            warm_window: DEFAULT_WARM_WINDOW,
            warm_on_startup: true,
        }
    }
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeduplicationConfig::default();

        assert!(config.enabled);
        assert_eq!(config.scope, FingerprintScope::IdentityTime);
        assert_eq!(config.ttl, Duration::from_secs(604_800));
        assert!(!config.ledger_verification);
        assert_eq!(config.warm_window, Duration::from_secs(86_400));
        assert!(config.warm_on_startup);
    }

    #[test]
    fn test_builder_methods() {
        let config = DeduplicationConfig::default()
            .with_enabled(false)
            .with_scope(FingerprintScope::FullPayload)
            .with_ttl(Duration::from_secs(60))
            .with_ledger_verification(true)
            .with_warm_window(Duration::from_secs(3600))
            .with_warm_on_startup(false);

        assert!(!config.enabled);
        assert_eq!(config.scope, FingerprintScope::FullPayload);
        assert_eq!(config.ttl, Duration::from_secs(60));
        assert!(config.ledger_verification);
        assert_eq!(config.warm_window, Duration::from_secs(3600));
        assert!(!config.warm_on_startup);
    }
}
