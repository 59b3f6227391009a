//! Events - タスク完了の通知

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::task::TaskType;

/// Side-effect notification emitted by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// The task reached `Done`.
    Completed {
        task_id: TaskId,
        task_type: TaskType,
        /// Failed attempts before the successful one.
        attempts: u32,
        completed_at: DateTime<Utc>,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Completed { task_id, .. } => *task_id,
        }
    }

    pub fn task_type(&self) -> &TaskType {
        match self {
            TaskEvent::Completed { task_type, .. } => task_type,
        }
    }
}
