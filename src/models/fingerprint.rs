//! Fingerprint types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a hex-encoded SHA-256 fingerprint.
pub const FINGERPRINT_LEN: usize = 64;

/// Deterministic digest identifying an event for deduplication.
///
/// Always 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps a digest produced by the canonicalizer.
    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    /// Parses a hex fingerprint read back from a store.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInput`] if the string is not 64 hex characters.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let s = s.trim();
        if s.len() != FINGERPRINT_LEN || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(crate::Error::InvalidInput(format!(
                "not a fingerprint: '{s}'"
            )));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Returns the hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the fast-tier key for this fingerprint.
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("evt:{}", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = crate::Error;

    fn try_from(s: String) -> crate::Result<Self> {
        Self::parse(&s)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Which parts of an event feed the fingerprint.
///
/// `IdentityAndTime` treats two submissions of the same action by the same
/// subject at the same instant as one event, whatever their payloads.
/// `FullPayload` additionally requires identical payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintScope {
    /// Name, effective subject and normalized instant.
    #[default]
    #[serde(alias = "identity")]
    IdentityTime,
    /// Identity and time plus the canonical payload.
    #[serde(alias = "payload")]
    FullPayload,
}

impl FingerprintScope {
    /// Returns the configuration name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IdentityTime => "identity_time",
            Self::FullPayload => "full_payload",
        }
    }

    /// Parses a configuration name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "identity_time" | "identity" => Some(Self::IdentityTime),
            "full_payload" | "payload" => Some(Self::FullPayload),
            _ => None,
        }
    }
}

impl fmt::Display for FingerprintScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_uppercase_hex() {
        let upper = "A".repeat(FINGERPRINT_LEN);
        let fp = Fingerprint::parse(&upper).unwrap();
        assert_eq!(fp.as_str(), "a".repeat(FINGERPRINT_LEN));
    }

    #[test]
    fn test_parse_rejects_wrong_length_and_charset() {
        assert!(Fingerprint::parse("abc").is_err());
        assert!(Fingerprint::parse(&"g".repeat(FINGERPRINT_LEN)).is_err());
    }

    #[test]
    fn test_cache_key_prefix() {
        let fp = Fingerprint::from_digest(&[0u8; 32]);
        assert_eq!(fp.cache_key(), format!("evt:{}", "0".repeat(64)));
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(
            FingerprintScope::parse("identity-time"),
            Some(FingerprintScope::IdentityTime)
        );
        assert_eq!(
            FingerprintScope::parse("FULL_PAYLOAD"),
            Some(FingerprintScope::FullPayload)
        );
        assert_eq!(FingerprintScope::parse("content"), None);
        assert_eq!(FingerprintScope::default().as_str(), "identity_time");
    }
}
