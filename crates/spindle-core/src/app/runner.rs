//! TaskRunner - claim → handle → done / retry / dead
//!
//! One `run_task` call executes at most one task end to end. Task-level
//! failures never escape as errors; the caller gets a `RunReport` or `None`.
//!
//! - Unknown task type: dead right away, no attempt counted.
//! - Permanent handler error: dead right away.
//! - Transient handler error or panic: dead when the dead-queue policy says
//!   so, otherwise retried after the back-off delay for the new attempt count.
//! - Post-claim writes are retried a bounded number of times; a write that
//!   still fails is escalated with `alert = true` and left to stall recovery.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::domain::{
    HandlerError, LeaseId, SpindleError, TaskEvent, TaskId, TaskRecord, TaskType,
};
use crate::impls::NoopEventPublisher;
use crate::policy::{BackOffPolicy, DeadQueuePolicy, earlier_by, later_by};
use crate::ports::{
    Clock, EventDelivery, EventPublisher, IdGenerator, SystemClock, TaskStore, UlidGenerator,
};
use crate::typed::{DynHandler, HandlerRegistry};

/// What happened to a claimed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    Done,
    Retried { next_run_at: DateTime<Utc> },
    Dead,
    /// Another runner reclaimed the task before our write landed.
    LeaseLost,
    /// The outcome could not be written; the task stays RUNNING until
    /// stall recovery releases it.
    Unpersisted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub disposition: Disposition,
}

enum WriteOutcome {
    Written,
    LeaseLost,
    Failed,
}

#[derive(Debug, PartialEq, Eq)]
enum HeartbeatOutcome {
    Refreshed,
    /// The execution finished between the snapshot and the refresh.
    Finished,
    LeaseLost,
    Failed,
}

/// Leases this process currently holds.
#[derive(Default)]
struct InFlight {
    leases: Mutex<HashMap<TaskId, LeaseId>>,
}

impl InFlight {
    fn track(self: &Arc<Self>, task_id: TaskId, lease: LeaseId) -> InFlightGuard {
        self.lock().insert(task_id, lease);
        InFlightGuard {
            in_flight: Arc::clone(self),
            task_id,
        }
    }

    fn holds(&self, task_id: TaskId, lease: LeaseId) -> bool {
        self.lock().get(&task_id) == Some(&lease)
    }

    fn snapshot(&self) -> Vec<(TaskId, LeaseId)> {
        self.lock().iter().map(|(id, lease)| (*id, *lease)).collect()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, LeaseId>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct InFlightGuard {
    in_flight: Arc<InFlight>,
    task_id: TaskId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.task_id);
    }
}

/// A task claimed under a lease and not yet executed.
///
/// The lease counts as in flight (and gets heartbeats) until this value, or
/// the execution it was handed to, is dropped.
pub struct ClaimedTask {
    record: TaskRecord,
    lease: LeaseId,
    _tracked: InFlightGuard,
}

impl ClaimedTask {
    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }
}

pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventPublisher>,
    back_off: Arc<dyn BackOffPolicy>,
    dead_queue: Arc<dyn DeadQueuePolicy>,
    event_delivery: EventDelivery,
    lease_duration: Duration,
    stall_cutoff: Duration,
    write_attempts: u32,
    write_retry_delay: Duration,
    in_flight: Arc<InFlight>,
}

impl TaskRunner {
    /// Runner with the policies described by `config`, the system clock and
    /// no event publisher.
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        config: &EngineConfig,
    ) -> Result<Self, SpindleError> {
        config.validate()?;
        Ok(Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            events: Arc::new(NoopEventPublisher),
            back_off: Arc::new(config.back_off()?),
            dead_queue: Arc::new(config.dead_queue()?),
            event_delivery: config.event_delivery,
            lease_duration: config.lease_duration(),
            stall_cutoff: config.stall_cutoff(),
            write_attempts: config.write_retry.attempts.max(1),
            write_retry_delay: config.write_retry_delay(),
            in_flight: Arc::default(),
        })
    }

    /// Replaces the clock; lease ids are derived from the same clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn with_back_off(mut self, back_off: Arc<dyn BackOffPolicy>) -> Self {
        self.back_off = back_off;
        self
    }

    pub fn with_dead_queue(mut self, dead_queue: Arc<dyn DeadQueuePolicy>) -> Self {
        self.dead_queue = dead_queue;
        self
    }

    /// Whether a due task exists. A failing store reads as "no work".
    pub async fn has_pending_tasks(&self) -> bool {
        match self.store.has_pending(self.clock.now()).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "pending check failed; skipping");
                false
            }
        }
    }

    /// Claim and execute the next due task, if any.
    pub async fn run_task(&self) -> Option<RunReport> {
        let claimed = self.claim_next().await?;
        Some(self.execute(claimed).await)
    }

    /// Claim the next due task under a fresh lease. Store failures read as
    /// an empty queue.
    pub async fn claim_next(&self) -> Option<ClaimedTask> {
        let now = self.clock.now();
        let lease = self.ids.generate_lease_id();
        let lease_expires_at = later_by(now, self.lease_duration);

        let record = match self.store.claim_next_due(now, lease, lease_expires_at).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                error!(error = %e, "claim failed; no work this tick");
                return None;
            }
        };

        debug!(
            task_id = %record.id,
            task_type = %record.task_type,
            attempt = record.attempts,
            lease = %lease,
            "task claimed"
        );
        Some(ClaimedTask {
            _tracked: self.in_flight.track(record.id, lease),
            record,
            lease,
        })
    }

    /// Run the handler of a claimed task and persist the outcome.
    pub async fn execute(&self, claimed: ClaimedTask) -> RunReport {
        let disposition = self.dispatch(&claimed.record, claimed.lease).await;
        RunReport {
            task_id: claimed.record.id,
            task_type: claimed.record.task_type.clone(),
            disposition,
        }
    }

    async fn dispatch(&self, record: &TaskRecord, lease: LeaseId) -> Disposition {
        let Some(handler) = self.registry.get(&record.task_type) else {
            let err = SpindleError::HandlerNotFound(record.task_type.clone());
            return self.finish_dead(record, lease, &err.to_string(), false).await;
        };

        match invoke(handler, record.payload.clone()).await {
            Ok(()) => self.finish_done(record, lease).await,
            Err(err) if err.is_permanent() => {
                self.finish_dead(record, lease, err.message(), true).await
            }
            Err(err) => self.finish_failed(record, lease, err).await,
        }
    }

    async fn finish_done(&self, record: &TaskRecord, lease: LeaseId) -> Disposition {
        let now = self.clock.now();
        let store = self.store.as_ref();
        let (id, task_type) = (record.id, &record.task_type);

        match self
            .persist(record, lease, "mark_done", move || store.mark_done(id, lease, now))
            .await
        {
            WriteOutcome::Written => {}
            WriteOutcome::LeaseLost => return Disposition::LeaseLost,
            WriteOutcome::Failed => return Disposition::Unpersisted,
        }
        debug!(
            task_id = %id,
            task_type = %task_type,
            attempt = record.attempts,
            lease = %lease,
            "task done"
        );

        self.emit(TaskEvent::Completed {
            task_id: id,
            task_type: task_type.clone(),
            attempts: record.attempts,
            completed_at: now,
        })
        .await;
        Disposition::Done
    }

    async fn finish_failed(
        &self,
        record: &TaskRecord,
        lease: LeaseId,
        err: HandlerError,
    ) -> Disposition {
        let now = self.clock.now();
        if self.dead_queue.is_dead(record, now) {
            let reason = format!("retention window exceeded; last error: {}", err.message());
            return self.finish_dead(record, lease, &reason, true).await;
        }

        let attempts = record.attempts.saturating_add(1);
        let delay = self.back_off.next_delay(attempts);
        let next_run_at = later_by(now, delay);

        let store = self.store.as_ref();
        let id = record.id;
        let message = err.message();
        let outcome = self
            .persist(record, lease, "mark_retry", move || {
                store.mark_retry(id, lease, next_run_at, message, now)
            })
            .await;

        match outcome {
            WriteOutcome::Written => {
                info!(
                    task_id = %id,
                    task_type = %record.task_type,
                    attempt = attempts,
                    lease = %lease,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "task failed; retry scheduled"
                );
                Disposition::Retried { next_run_at }
            }
            WriteOutcome::LeaseLost => Disposition::LeaseLost,
            WriteOutcome::Failed => Disposition::Unpersisted,
        }
    }

    async fn finish_dead(
        &self,
        record: &TaskRecord,
        lease: LeaseId,
        reason: &str,
        count_attempt: bool,
    ) -> Disposition {
        let now = self.clock.now();
        let store = self.store.as_ref();
        let id = record.id;

        match self
            .persist(record, lease, "mark_dead", move || {
                store.mark_dead(id, lease, reason, count_attempt, now)
            })
            .await
        {
            WriteOutcome::Written => {
                warn!(
                    task_id = %id,
                    task_type = %record.task_type,
                    attempt = record.attempts,
                    lease = %lease,
                    reason,
                    "task dead"
                );
                Disposition::Dead
            }
            WriteOutcome::LeaseLost => Disposition::LeaseLost,
            WriteOutcome::Failed => Disposition::Unpersisted,
        }
    }

    /// Bounded retry of one post-claim write. Lease loss is final.
    async fn persist<F, Fut>(
        &self,
        record: &TaskRecord,
        lease: LeaseId,
        op: &'static str,
        mut write: F,
    ) -> WriteOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), SpindleError>>,
    {
        for attempt in 1..=self.write_attempts {
            match write().await {
                Ok(()) => return WriteOutcome::Written,
                Err(SpindleError::LeaseLost { .. }) => {
                    warn!(
                        task_id = %record.id,
                        task_type = %record.task_type,
                        lease = %lease,
                        op,
                        "lease lost; task was reclaimed by another runner"
                    );
                    return WriteOutcome::LeaseLost;
                }
                Err(e) if attempt < self.write_attempts => {
                    warn!(
                        task_id = %record.id,
                        lease = %lease,
                        op,
                        try_no = attempt,
                        error = %e,
                        "persistence write failed; retrying"
                    );
                    tokio::time::sleep(self.write_retry_delay).await;
                }
                Err(e) => {
                    error!(
                        task_id = %record.id,
                        task_type = %record.task_type,
                        lease = %lease,
                        op,
                        alert = true,
                        error = %e,
                        "persistence write failed; task left RUNNING for stall recovery"
                    );
                    return WriteOutcome::Failed;
                }
            }
        }
        WriteOutcome::Failed
    }

    async fn emit(&self, event: TaskEvent) {
        match self.event_delivery {
            EventDelivery::Synchronous => {
                if let Err(e) = self.events.publish(event).await {
                    warn!(error = %e, "completion event not published");
                }
            }
            EventDelivery::FireAndForget => {
                let events = Arc::clone(&self.events);
                tokio::spawn(async move {
                    let task_id = event.task_id();
                    if let Err(e) = events.publish(event).await {
                        warn!(task_id = %task_id, error = %e, "completion event not published");
                    }
                });
            }
        }
    }

    /// Extend the lease of every task this process is executing. Returns how
    /// many leases were refreshed.
    pub async fn update_heartbeat(&self) -> usize {
        let now = self.clock.now();
        let lease_expires_at = later_by(now, self.lease_duration);
        let mut refreshed = 0;

        for (task_id, lease) in self.in_flight.snapshot() {
            if self.refresh_one(task_id, lease, now, lease_expires_at).await
                == HeartbeatOutcome::Refreshed
            {
                refreshed += 1;
            }
        }
        debug!(refreshed, "heartbeat");
        refreshed
    }

    async fn refresh_one(
        &self,
        task_id: TaskId,
        lease: LeaseId,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> HeartbeatOutcome {
        match self
            .store
            .refresh_heartbeat(task_id, lease, now, lease_expires_at)
            .await
        {
            Ok(true) => HeartbeatOutcome::Refreshed,
            // 完了済みなら lease はもう追跡されていない
            Ok(false) if !self.in_flight.holds(task_id, lease) => {
                debug!(task_id = %task_id, lease = %lease, "heartbeat skipped; task finished");
                HeartbeatOutcome::Finished
            }
            Ok(false) => {
                warn!(task_id = %task_id, lease = %lease, "heartbeat rejected; lease lost");
                HeartbeatOutcome::LeaseLost
            }
            Err(e) => {
                error!(task_id = %task_id, lease = %lease, error = %e, "heartbeat failed");
                HeartbeatOutcome::Failed
            }
        }
    }

    /// Release every RUNNING task whose heartbeat predates `cutoff`.
    pub async fn retrieve_stalled_tasks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, SpindleError> {
        let reclaimed = self.store.reclaim_stale(cutoff).await?;
        if reclaimed > 0 {
            info!(reclaimed, cutoff = %cutoff, "stalled tasks returned to pending");
        }
        Ok(reclaimed)
    }

    /// `retrieve_stalled_tasks` with the configured cutoff.
    pub async fn recover_stalled(&self) -> Result<u64, SpindleError> {
        let cutoff = earlier_by(self.clock.now(), self.stall_cutoff);
        self.retrieve_stalled_tasks(cutoff).await
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

/// Runs the handler on its own task so a panic surfaces as a transient failure.
async fn invoke(
    handler: Arc<dyn DynHandler>,
    payload: serde_json::Value,
) -> Result<(), HandlerError> {
    match tokio::spawn(async move { handler.handle_dyn(payload).await }).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            let panic = join_err.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(HandlerError::new(format!("handler panicked: {message}")))
        }
        Err(join_err) => Err(HandlerError::new(format!("handler aborted: {join_err}"))),
    }
}
