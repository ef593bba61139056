//! Deduplication result types.

use super::Fingerprint;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Business outcome of a deduplication decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// First sighting; the caller owns this fingerprint.
    Accepted,
    /// Already claimed by an earlier (or concurrent) caller.
    Duplicate,
}

impl Verdict {
    /// Returns the wire/metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate => "duplicate",
        }
    }

    /// Returns true for [`Verdict::Duplicate`].
    #[must_use]
    pub const fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`crate::DeduplicationService::is_duplicate_and_claim`].
///
/// # Example
///
/// ```rust
/// use eventdedup::{Canonicalizer, DedupOutcome, Event, Verdict};
///
/// let fp = Canonicalizer::default()
///     .fingerprint(&Event::new("signup", "2024-01-01T00:00:00Z"))
///     .unwrap();
/// let outcome = DedupOutcome::accepted(fp, 2);
///
/// assert_eq!(outcome.verdict, Verdict::Accepted);
/// assert!(!outcome.is_duplicate());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupOutcome {
    /// The decision.
    pub verdict: Verdict,
    /// Fingerprint the decision was made on.
    pub fingerprint: Fingerprint,
    /// Duration of the check in milliseconds.
    pub check_duration_ms: u64,
}

impl DedupOutcome {
    /// Creates an accepted outcome.
    #[must_use]
    pub const fn accepted(fingerprint: Fingerprint, duration_ms: u64) -> Self {
        Self {
            verdict: Verdict::Accepted,
            fingerprint,
            check_duration_ms: duration_ms,
        }
    }

    /// Creates a duplicate outcome.
    #[must_use]
    pub const fn duplicate(fingerprint: Fingerprint, duration_ms: u64) -> Self {
        Self {
            verdict: Verdict::Duplicate,
            fingerprint,
            check_duration_ms: duration_ms,
        }
    }

    /// Returns true if the event was a duplicate.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        self.verdict.is_duplicate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_display() {
        assert_eq!(Verdict::Accepted.to_string(), "accepted");
        assert_eq!(Verdict::Duplicate.to_string(), "duplicate");
    }

    #[test]
    fn test_verdict_serde_snake_case() {
        let json = serde_json::to_string(&Verdict::Duplicate).unwrap();
        assert_eq!(json, "\"duplicate\"");
    }
}
