//! Quarantine bookkeeping for misbehaving vantage points.

use chrono::{DateTime, Duration, Utc};

/// First offense sits out a week.
pub const DEFAULT_QUARANTINE_DAYS: i64 = 7;

/// One quarantine term. Repeat offenders get doubled terms.
#[derive(Debug, Clone, Copy)]
pub struct Quarantine {
    pub since: DateTime<Utc>,
    pub days: i64,
}

impl Quarantine {
    pub fn new(now: DateTime<Utc>) -> Self {
        Quarantine {
            since: now,
            days: DEFAULT_QUARANTINE_DAYS,
        }
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now - self.since >= Duration::days(self.days)
    }

    /// The follow-up term for a vantage point that came back and failed
    /// again.
    pub fn again(&self, now: DateTime<Utc>) -> Quarantine {
        Quarantine {
            since: now,
            days: self.days.saturating_mul(2),
        }
    }
}
