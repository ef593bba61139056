//! Durable ledger backends.

mod memory;
mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

use chrono::{DateTime, TimeDelta, Utc};

/// Shortest retention a ledger accepts, in days.
pub const MIN_RETENTION_DAYS: u32 = 7;
/// Longest retention a ledger accepts, in days.
pub const MAX_RETENTION_DAYS: u32 = 30;

/// How long ledger rows stay visible, measured from insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    days: u32,
}

impl RetentionPolicy {
    /// Creates a policy, clamping to the supported 7–30 day range.
    #[must_use]
    pub fn days(days: u32) -> Self {
        let clamped = days.clamp(MIN_RETENTION_DAYS, MAX_RETENTION_DAYS);
        if clamped != days {
            tracing::warn!(
                requested = days,
                applied = clamped,
                "Ledger retention clamped to supported range"
            );
        }
        Self { days: clamped }
    }

    /// Retention in days.
    #[must_use]
    pub const fn as_days(self) -> u32 {
        self.days
    }

    /// Rows inserted before this instant are expired.
    #[must_use]
    pub fn cutoff(self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - TimeDelta::days(i64::from(self.days))
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            days: MAX_RETENTION_DAYS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 7; "below minimum")]
    #[test_case(7, 7; "minimum")]
    #[test_case(14, 14; "inside range")]
    #[test_case(30, 30; "maximum")]
    #[test_case(365, 30; "above maximum")]
    fn test_retention_clamps(requested: u32, applied: u32) {
        assert_eq!(RetentionPolicy::days(requested).as_days(), applied);
    }

    #[test]
    fn test_cutoff() {
        let now = Utc::now();
        assert_eq!(
            RetentionPolicy::days(7).cutoff(now),
            now - TimeDelta::days(7)
        );
        assert_eq!(RetentionPolicy::default().as_days(), 30);
    }
}
