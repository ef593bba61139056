//! Storage backend selection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which fast-tier implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FastTierBackend {
    /// Process-local map. Lost on restart.
    #[default]
    Memory,
    /// Redis `SET NX EX` (requires the `redis` feature).
    Redis,
}

impl FastTierBackend {
    /// Parses a backend name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Some(Self::Memory),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }

    /// Returns the backend name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
        }
    }
}

impl fmt::Display for FastTierBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which durable ledger implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// Process-local ordered map.
    Memory,
    /// `SQLite` file.
    #[default]
    Sqlite,
}

impl LedgerBackend {
    /// Parses a backend name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Some(Self::Memory),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Returns the backend name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for LedgerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("memory", Some(FastTierBackend::Memory))]
    #[test_case("Redis", Some(FastTierBackend::Redis))]
    #[test_case("memcached", None)]
    fn test_fast_tier_backend_parse(input: &str, expected: Option<FastTierBackend>) {
        assert_eq!(FastTierBackend::parse(input), expected);
    }

    #[test_case("sqlite", Some(LedgerBackend::Sqlite))]
    #[test_case(" MEMORY ", Some(LedgerBackend::Memory))]
    #[test_case("clickhouse", None)]
    fn test_ledger_backend_parse(input: &str, expected: Option<LedgerBackend>) {
        assert_eq!(LedgerBackend::parse(input), expected);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(FastTierBackend::default(), FastTierBackend::Memory);
        assert_eq!(LedgerBackend::default(), LedgerBackend::Sqlite);
    }
}
