//! Retry and retirement policies. Both are pure and clock-free.

mod backoff;
mod dead_queue;

pub use backoff::{BackOffPolicy, ExpandingBackOff};
pub use dead_queue::{DeadQueuePolicy, TimeBasedDeadQueue};

use chrono::{DateTime, TimeDelta, Utc};

/// Saturating conversion.
pub(crate) fn to_time_delta(duration: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::days(365 * 100))
}

/// `at + duration`, clamped to the last representable instant.
pub(crate) fn later_by(at: DateTime<Utc>, duration: std::time::Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_time_delta(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - duration`, clamped to the first representable instant.
pub(crate) fn earlier_by(at: DateTime<Utc>, duration: std::time::Duration) -> DateTime<Utc> {
    at.checked_sub_signed(to_time_delta(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
