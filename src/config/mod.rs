//! Configuration management.
//!
//! Precedence, lowest first: built-in defaults, the TOML config file,
//! `EVENTDEDUP_*` environment variables.

mod backends;

pub use backends::{FastTierBackend, LedgerBackend};

use crate::services::deduplication::{
    BatchConfig, DeduplicationConfig, ExhaustedPolicy, env_bool, env_u64,
};
use crate::models::FingerprintScope;
use crate::storage::ledger::MAX_RETENTION_DAYS;
use crate::storage::sqlite::DEFAULT_BUSY_TIMEOUT;
use crate::storage::{DEFAULT_REDIS_TIMEOUT, RetentionPolicy, StorageResilienceConfig};
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name used for the platform config directory.
pub const APP_NAME: &str = "eventdedup";

/// Fast-tier settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastTierSettings {
    /// Backend to run.
    pub backend: FastTierBackend,
    /// Redis connection URL.
    pub url: String,
    /// Connect/read/write timeout.
    pub timeout: Duration,
}

impl Default for FastTierSettings {
    fn default() -> Self {
        Self {
            backend: FastTierBackend::Memory,
            url: "redis://localhost:6379".to_string(),
            timeout: DEFAULT_REDIS_TIMEOUT,
        }
    }
}

/// Durable ledger settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSettings {
    /// Backend to run.
    pub backend: LedgerBackend,
    /// `SQLite` database path.
    pub path: PathBuf,
    /// Row retention.
    pub retention: RetentionPolicy,
    /// `SQLite` busy timeout.
    pub busy_timeout: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Sqlite,
            path: PathBuf::from("eventdedup.db"),
            retention: RetentionPolicy::default(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Listen port.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

/// Logging settings from config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LoggingSettings {
    /// `pretty` or `json`.
    pub format: Option<String>,
    /// Filter directive, e.g. `info,eventdedup=debug`.
    pub filter: Option<String>,
    /// Log file path. Logs go to stderr when unset.
    pub file: Option<String>,
}

/// Metrics settings from config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MetricsSettings {
    /// Whether the Prometheus recorder is installed.
    pub enabled: Option<bool>,
    /// Exporter listen port.
    pub port: Option<u16>,
}

/// Main configuration for eventdedup.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Fast tier.
    pub fast_tier: FastTierSettings,
    /// Durable ledger.
    pub ledger: LedgerSettings,
    /// Coordinator settings.
    pub dedup: DeduplicationConfig,
    /// Write buffer settings.
    pub batch: BatchConfig,
    /// Circuit breaker settings.
    pub resilience: StorageResilienceConfig,
    /// HTTP server.
    pub server: ServerSettings,
    /// Logging.
    pub logging: LoggingSettings,
    /// Metrics.
    pub metrics: MetricsSettings,
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Fast tier section.
    pub fast_tier: Option<ConfigFileFastTier>,
    /// Ledger section.
    pub ledger: Option<ConfigFileLedger>,
    /// Deduplication section.
    pub dedup: Option<ConfigFileDedup>,
    /// Write buffer section.
    pub batch: Option<ConfigFileBatch>,
    /// Circuit breaker section.
    pub resilience: Option<ConfigFileResilience>,
    /// Server section.
    pub server: Option<ConfigFileServer>,
    /// Logging section.
    pub logging: Option<LoggingSettings>,
    /// Metrics section.
    pub metrics: Option<MetricsSettings>,
}

/// `[fast_tier]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileFastTier {
    /// `memory` or `redis`.
    pub backend: Option<String>,
    /// Redis URL.
    pub url: Option<String>,
    /// Record lifetime in seconds.
    pub ttl_secs: Option<u64>,
    /// Timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// `[ledger]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileLedger {
    /// `memory` or `sqlite`.
    pub backend: Option<String>,
    /// Database path.
    pub path: Option<String>,
    /// Retention in days (clamped to 7-30).
    pub retention_days: Option<u32>,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: Option<u64>,
}

/// `[dedup]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileDedup {
    /// Kill switch.
    pub enabled: Option<bool>,
    /// `identity_time` or `full_payload`.
    pub scope: Option<String>,
    /// Consult the ledger after a claim.
    pub ledger_verification: Option<bool>,
    /// Cache-warming window in seconds.
    pub warm_window_secs: Option<u64>,
    /// Warm on startup.
    pub warm_on_startup: Option<bool>,
}

/// `[batch]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileBatch {
    /// Flush threshold.
    pub flush_threshold: Option<usize>,
    /// Chunk size.
    pub max_batch_size: Option<usize>,
    /// Attempts per chunk.
    pub max_attempts: Option<u32>,
    /// Initial backoff in milliseconds.
    pub retry_backoff_ms: Option<u64>,
    /// Background flush interval in milliseconds.
    pub flush_interval_ms: Option<u64>,
    /// `discard` or `retain`.
    pub on_exhausted: Option<String>,
    /// Backlog cap.
    pub max_pending: Option<usize>,
}

/// `[resilience]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileResilience {
    /// Consecutive failures before opening.
    pub failure_threshold: Option<u32>,
    /// Open duration in milliseconds.
    pub reset_timeout_ms: Option<u64>,
    /// Trial calls while half-open.
    pub half_open_max_calls: Option<u32>,
}

/// `[server]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileServer {
    /// Listen port.
    pub port: Option<u16>,
}

impl AppConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the configuration used by the binary.
    ///
    /// Reads `path` when given, otherwise the default location, then applies
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly given file cannot be read or parsed,
    /// or if it names an unknown backend, scope or policy.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_default(),
        };
        Ok(config.with_env_overrides())
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::failed("read_config_file", format!("{}: {e}", path.display())))?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| Error::failed("parse_config_file", e))?;
        Self::from_config_file(file)
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the platform config dir (`~/.config/eventdedup/config.toml` on
    /// Linux). Returns default configuration if no usable file is found.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable config file");
                Self::default()
            },
        }
    }

    /// Platform-specific config file path.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Converts a `ConfigFile` to `AppConfig`.
    fn from_config_file(file: ConfigFile) -> Result<Self> {
        let mut config = Self::default();

        if let Some(fast) = file.fast_tier {
            if let Some(backend) = fast.backend {
                config.fast_tier.backend = FastTierBackend::parse(&backend).ok_or_else(|| {
                    Error::InvalidInput(format!("unknown fast_tier.backend '{backend}'"))
                })?;
            }
            if let Some(url) = fast.url {
                config.fast_tier.url = url;
            }
            if let Some(secs) = fast.ttl_secs {
                if secs == 0 {
                    return Err(Error::InvalidInput(
                        "fast_tier.ttl_secs must be at least 1".to_string(),
                    ));
                }
                config.dedup.ttl = Duration::from_secs(secs);
            }
            if let Some(ms) = fast.timeout_ms {
                config.fast_tier.timeout = Duration::from_millis(ms);
            }
        }

        if let Some(ledger) = file.ledger {
            if let Some(backend) = ledger.backend {
                config.ledger.backend = LedgerBackend::parse(&backend).ok_or_else(|| {
                    Error::InvalidInput(format!("unknown ledger.backend '{backend}'"))
                })?;
            }
            if let Some(path) = ledger.path {
                config.ledger.path = PathBuf::from(path);
            }
            if let Some(days) = ledger.retention_days {
                config.ledger.retention = RetentionPolicy::days(days);
            }
            if let Some(ms) = ledger.busy_timeout_ms {
                config.ledger.busy_timeout = Duration::from_millis(ms);
            }
        }

        if let Some(dedup) = file.dedup {
            if let Some(v) = dedup.enabled {
                config.dedup.enabled = v;
            }
            if let Some(scope) = dedup.scope {
                config.dedup.scope = FingerprintScope::parse(&scope)
                    .ok_or_else(|| Error::InvalidInput(format!("unknown dedup.scope '{scope}'")))?;
            }
            if let Some(v) = dedup.ledger_verification {
                config.dedup.ledger_verification = v;
            }
            if let Some(secs) = dedup.warm_window_secs {
                config.dedup.warm_window = Duration::from_secs(secs);
            }
            if let Some(v) = dedup.warm_on_startup {
                config.dedup.warm_on_startup = v;
            }
        }

        if let Some(batch) = file.batch {
            if let Some(v) = batch.flush_threshold {
                config.batch.flush_threshold = v;
            }
            if let Some(v) = batch.max_batch_size {
                config.batch.max_batch_size = v;
            }
            if let Some(v) = batch.max_attempts {
                config.batch.max_attempts = v;
            }
            if let Some(ms) = batch.retry_backoff_ms {
                config.batch.retry_backoff = Duration::from_millis(ms);
            }
            if let Some(ms) = batch.flush_interval_ms {
                config.batch.flush_interval = Duration::from_millis(ms);
            }
            if let Some(policy) = batch.on_exhausted {
                config.batch.on_exhausted = ExhaustedPolicy::parse(&policy).ok_or_else(|| {
                    Error::InvalidInput(format!("unknown batch.on_exhausted '{policy}'"))
                })?;
            }
            if let Some(v) = batch.max_pending {
                config.batch.max_pending = v;
            }
        }

        if let Some(resilience) = file.resilience {
            if let Some(v) = resilience.failure_threshold {
                config.resilience.breaker_failure_threshold = v.max(1);
            }
            if let Some(v) = resilience.reset_timeout_ms {
                config.resilience.breaker_reset_timeout_ms = v;
            }
            if let Some(v) = resilience.half_open_max_calls {
                config.resilience.breaker_half_open_max_calls = v.max(1);
            }
        }

        if let Some(port) = file.server.and_then(|s| s.port) {
            config.server.port = port;
        }
        if let Some(logging) = file.logging {
            config.logging = logging;
        }
        if let Some(metrics) = file.metrics {
            config.metrics = metrics;
        }

        Ok(config)
    }

    /// Applies `EVENTDEDUP_*` environment overrides.
    ///
    /// Unparseable values are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(backend) = env_string("EVENTDEDUP_FAST_TIER_BACKEND")
            .and_then(|v| FastTierBackend::parse(&v))
        {
            self.fast_tier.backend = backend;
        }
        if let Some(url) = env_string("EVENTDEDUP_FAST_TIER_URL") {
            self.fast_tier.url = url;
        }
        if let Some(ms) = env_u64("EVENTDEDUP_FAST_TIER_TIMEOUT_MS") {
            self.fast_tier.timeout = Duration::from_millis(ms);
        }

        if let Some(backend) =
            env_string("EVENTDEDUP_LEDGER_BACKEND").and_then(|v| LedgerBackend::parse(&v))
        {
            self.ledger.backend = backend;
        }
        if let Some(path) = env_string("EVENTDEDUP_LEDGER_PATH") {
            self.ledger.path = PathBuf::from(path);
        }
        if let Some(days) = env_u64("EVENTDEDUP_LEDGER_RETENTION_DAYS") {
            let days = u32::try_from(days).unwrap_or(MAX_RETENTION_DAYS);
            self.ledger.retention = RetentionPolicy::days(days);
        }
        if let Some(ms) = env_u64("EVENTDEDUP_LEDGER_BUSY_TIMEOUT_MS") {
            self.ledger.busy_timeout = Duration::from_millis(ms);
        }

        self.dedup = self.dedup.with_env_overrides();
        self.batch = self.batch.with_env_overrides();
        self.resilience = self.resilience.with_env_overrides();

        if let Some(port) = env_u64("EVENTDEDUP_SERVER_PORT").and_then(|p| u16::try_from(p).ok()) {
            self.server.port = port;
        }
        if let Some(format) = env_string("EVENTDEDUP_LOG_FORMAT") {
            self.logging.format = Some(format);
        }
        if let Some(filter) = env_string("EVENTDEDUP_LOG") {
            self.logging.filter = Some(filter);
        }
        if let Some(file) = env_string("EVENTDEDUP_LOG_FILE") {
            self.logging.file = Some(file);
        }
        if let Some(enabled) = env_bool("EVENTDEDUP_METRICS_ENABLED") {
            self.metrics.enabled = Some(enabled);
        }
        if let Some(port) = env_u64("EVENTDEDUP_METRICS_PORT").and_then(|p| u16::try_from(p).ok())
        {
            self.metrics.port = Some(port);
        }

        self
    }

    /// Sets the ledger path.
    #[must_use]
    pub fn with_ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger.path = path.into();
        self
    }

    /// Sets the ledger backend.
    #[must_use]
    pub const fn with_ledger_backend(mut self, backend: LedgerBackend) -> Self {
        self.ledger.backend = backend;
        self
    }

    /// Sets the fast-tier backend.
    #[must_use]
    pub const fn with_fast_tier_backend(mut self, backend: FastTierBackend) -> Self {
        self.fast_tier.backend = backend;
        self
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
