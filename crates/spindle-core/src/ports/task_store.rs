//! TaskStore port - タスク表の正本（source of truth）
//!
//! The store exclusively owns task persistence. All cross-process
//! coordination goes through it:
//! - `claim_next_due` is the only serialization point and must be a single
//!   atomic conditional update. A lost race yields `Ok(None)`, never an error.
//! - Every write after a claim names the lease it was claimed under. A write
//!   whose lease no longer matches a `Running` row fails with
//!   `SpindleError::LeaseLost` and changes nothing.
//! - Rows are never deleted here; purging `Done`/`Dead` rows is housekeeping
//!   outside the engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::app::status::QueueCounts;
use crate::domain::{LeaseId, SpindleError, TaskId, TaskRecord};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new `Pending` record.
    async fn insert(&self, record: TaskRecord) -> Result<(), SpindleError>;

    /// Atomically move the oldest due `Pending` row (by `scheduled_for`,
    /// then creation) to `Running` under `lease`.
    async fn claim_next_due(
        &self,
        now: DateTime<Utc>,
        lease: LeaseId,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, SpindleError>;

    async fn mark_done(
        &self,
        id: TaskId,
        lease: LeaseId,
        now: DateTime<Utc>,
    ) -> Result<(), SpindleError>;

    /// Running -> Pending: increments `attempts`, clears the lease and moves
    /// `scheduled_for` to `next_run_at` (never backwards).
    async fn mark_retry(
        &self,
        id: TaskId,
        lease: LeaseId,
        next_run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SpindleError>;

    /// Running -> Dead. `count_attempt` is false when the handler never ran
    /// (unknown task type).
    async fn mark_dead(
        &self,
        id: TaskId,
        lease: LeaseId,
        reason: &str,
        count_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<(), SpindleError>;

    /// Extend a held lease. Returns `false` when the lease is no longer held.
    async fn refresh_heartbeat(
        &self,
        id: TaskId,
        lease: LeaseId,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, SpindleError>;

    /// Reset every `Running` row whose last heartbeat is before `older_than`
    /// to `Pending`, lease cleared, attempts unchanged. Returns the count.
    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64, SpindleError>;

    async fn has_pending(&self, now: DateTime<Utc>) -> Result<bool, SpindleError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, SpindleError>;

    async fn counts_by_status(&self) -> Result<QueueCounts, SpindleError>;
}
