//! Dead-queue policy: decides when a still-failing task is retired for good.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::to_time_delta;
use crate::domain::{SpindleError, TaskRecord};

pub trait DeadQueuePolicy: Send + Sync {
    fn is_dead(&self, record: &TaskRecord, now: DateTime<Utc>) -> bool;
}

/// Retires a task once its age since creation exceeds the retention window,
/// whatever its attempt count. Retry storms are bounded by calendar time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeBasedDeadQueue {
    retention: Duration,
}

impl TimeBasedDeadQueue {
    pub fn new(retention: Duration) -> Result<Self, SpindleError> {
        if retention.is_zero() {
            return Err(SpindleError::Config(
                "dead queue retention window must be positive".into(),
            ));
        }
        Ok(Self { retention })
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }
}

impl Default for TimeBasedDeadQueue {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(15 * 24 * 60 * 60),
        }
    }
}

impl DeadQueuePolicy for TimeBasedDeadQueue {
    fn is_dead(&self, record: &TaskRecord, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(record.created_at) > to_time_delta(self.retention)
    }
}
