//! Task record: the unit of durable work, and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{LeaseId, TaskId};

/// String tag used to resolve the handler of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Persisted status of a task.
///
/// State transitions:
/// - Pending -> Running (claim)
/// - Running -> Done
/// - Running -> Pending (retry with deferred `scheduled_for`, or stall recovery)
/// - Running -> Dead
///
/// `Done` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Dead,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Dead => "DEAD",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "DONE" => Ok(TaskStatus::Done),
            "DEAD" => Ok(TaskStatus::Dead),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// One row of the task table.
///
/// Invariants kept by the store:
/// - `Running` has both `lease_owner` and `lease_expires_at` set.
/// - `Pending` has no lease.
/// - `attempts` grows by one per failed execution only.
/// - `scheduled_for` never moves backwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub status: TaskStatus,

    /// Number of failed executions so far.
    pub attempts: u32,

    /// Earliest time the task may be claimed.
    pub scheduled_for: DateTime<Utc>,

    pub lease_owner: Option<LeaseId>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    /// Last update; while running this doubles as the heartbeat.
    pub heartbeat_at: DateTime<Utc>,

    /// Message of the most recent failure, if any.
    pub last_error: Option<String>,
}

impl TaskRecord {
    /// Fresh `Pending` record with zero attempts.
    pub fn new_pending(
        id: TaskId,
        task_type: TaskType,
        payload: serde_json::Value,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            payload,
            status: TaskStatus::Pending,
            attempts: 0,
            scheduled_for,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            heartbeat_at: now,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_for <= now
    }

    pub fn is_held_by(&self, lease: LeaseId) -> bool {
        self.status == TaskStatus::Running && self.lease_owner == Some(lease)
    }

    /// Pending -> Running.
    pub fn claim(&mut self, lease: LeaseId, lease_expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.lease_owner = Some(lease);
        self.lease_expires_at = Some(lease_expires_at);
        self.heartbeat_at = now;
    }

    pub fn mark_done(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Done;
        self.clear_lease();
        self.heartbeat_at = now;
    }

    /// Running -> Pending after a failure: one more attempt, pushed out to `next_run_at`.
    pub fn schedule_retry(&mut self, next_run_at: DateTime<Utc>, error: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.attempts += 1;
        self.scheduled_for = self.scheduled_for.max(next_run_at);
        self.last_error = Some(error);
        self.clear_lease();
        self.heartbeat_at = now;
    }

    /// Running -> Dead. Counts as a failed attempt when the handler ran.
    pub fn mark_dead(&mut self, reason: String, count_attempt: bool, now: DateTime<Utc>) {
        self.status = TaskStatus::Dead;
        if count_attempt {
            self.attempts += 1;
        }
        self.last_error = Some(reason);
        self.clear_lease();
        self.heartbeat_at = now;
    }

    /// Running -> Pending without touching `attempts`; the outcome is unknown.
    pub fn release_stalled(&mut self) {
        self.status = TaskStatus::Pending;
        self.clear_lease();
    }

    fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}
