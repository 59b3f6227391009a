//! TaskPublisher - タスクの投入口
//!
//! Builds a `Pending` record and hands it to the store. No event is emitted
//! at publish time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{SpindleError, TaskId, TaskRecord, TaskType};
use crate::ports::{Clock, IdGenerator, TaskStore};
use crate::typed::Task;

#[derive(Clone)]
pub struct TaskPublisher {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl TaskPublisher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self { store, clock, ids }
    }

    /// Enqueue a task that is due immediately.
    pub async fn publish(
        &self,
        task_type: impl Into<TaskType>,
        payload: serde_json::Value,
    ) -> Result<TaskId, SpindleError> {
        let now = self.clock.now();
        self.insert(task_type.into(), payload, now, now).await
    }

    /// Enqueue a task that must not be claimed before `scheduled_for`.
    pub async fn publish_at(
        &self,
        task_type: impl Into<TaskType>,
        payload: serde_json::Value,
        scheduled_for: DateTime<Utc>,
    ) -> Result<TaskId, SpindleError> {
        let now = self.clock.now();
        self.insert(task_type.into(), payload, scheduled_for, now)
            .await
    }

    /// Typed variant: the payload is serialized from `task`, the type tag is `T::TYPE`.
    pub async fn publish_task<T: Task>(&self, task: &T) -> Result<TaskId, SpindleError> {
        let payload = serde_json::to_value(task)?;
        self.publish(T::TYPE, payload).await
    }

    pub async fn publish_task_at<T: Task>(
        &self,
        task: &T,
        scheduled_for: DateTime<Utc>,
    ) -> Result<TaskId, SpindleError> {
        let payload = serde_json::to_value(task)?;
        self.publish_at(T::TYPE, payload, scheduled_for).await
    }

    async fn insert(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TaskId, SpindleError> {
        if task_type.is_empty() {
            return Err(SpindleError::InvalidTask(
                "task type must not be empty".into(),
            ));
        }
        let id = self.ids.generate_task_id();
        let record = TaskRecord::new_pending(id, task_type, payload, scheduled_for, now);
        debug!(
            task_id = %id,
            task_type = %record.task_type,
            scheduled_for = %scheduled_for,
            "task published"
        );
        self.store.insert(record).await?;
        Ok(id)
    }
}
