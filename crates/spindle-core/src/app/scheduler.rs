//! TaskScheduler - 定期実行ループ
//!
//! Three timers drive a `TaskRunner`:
//! - dispatch (`poll_interval`): claim due tasks while permits remain
//! - heartbeat (`heartbeat_interval`): extend the leases held by this process
//! - stall recovery (`stall_recovery_interval`): release leases gone silent
//!
//! The semaphore bounds concurrency inside one process only; across
//! processes the store's atomic claim is what keeps executions exclusive.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::runner::TaskRunner;
use crate::config::EngineConfig;

pub struct TaskScheduler {
    runner: Arc<TaskRunner>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    stall_recovery_interval: Duration,
}

impl TaskScheduler {
    pub fn new(runner: Arc<TaskRunner>, config: &EngineConfig) -> Self {
        let max_concurrent = config.max_concurrent_tasks.max(1);
        Self {
            runner,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            stall_recovery_interval: config.stall_recovery_interval(),
        }
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    /// Permits not held by a running execution.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// One dispatch tick. Returns how many executions were launched.
    ///
    /// Stops at the first of: queue empty, permits exhausted, claim lost.
    /// Leftover work waits for the next tick.
    pub async fn tick(&self) -> usize {
        let mut launched = 0;
        while self.runner.has_pending_tasks().await {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            // permit は claim に失敗すればここで drop される
            let Some(claimed) = self.runner.claim_next().await else {
                break;
            };

            let runner = Arc::clone(&self.runner);
            tokio::spawn(async move {
                let _permit = permit;
                runner.execute(claimed).await;
            });
            launched += 1;
        }
        if launched > 0 {
            debug!(launched, in_flight = self.runner.in_flight(), "dispatch tick");
        }
        launched
    }

    /// Start the three loops on the current runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let scheduler = Arc::new(self);
        let (dispatch_tx, dispatch_rx) = watch::channel(false);
        let (maintenance_tx, maintenance_rx) = watch::channel(false);

        let dispatch = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(run_every(scheduler.poll_interval, dispatch_rx, move || {
                let scheduler = Arc::clone(&scheduler);
                async move {
                    scheduler.tick().await;
                }
            }))
        };

        let heartbeat = {
            let runner = Arc::clone(&scheduler.runner);
            tokio::spawn(run_every(
                scheduler.heartbeat_interval,
                maintenance_rx.clone(),
                move || {
                    let runner = Arc::clone(&runner);
                    async move {
                        runner.update_heartbeat().await;
                    }
                },
            ))
        };

        let stall_recovery = {
            let runner = Arc::clone(&scheduler.runner);
            tokio::spawn(run_every(
                scheduler.stall_recovery_interval,
                maintenance_rx,
                move || {
                    let runner = Arc::clone(&runner);
                    async move {
                        if let Err(e) = runner.recover_stalled().await {
                            error!(error = %e, "stall recovery failed");
                        }
                    }
                },
            ))
        };

        info!(
            max_concurrent = scheduler.max_concurrent,
            poll_interval_ms = scheduler.poll_interval.as_millis() as u64,
            "scheduler started"
        );

        SchedulerHandle {
            scheduler,
            dispatch_tx,
            maintenance_tx,
            dispatch,
            maintenance: vec![heartbeat, stall_recovery],
        }
    }
}

/// Handle of a running scheduler.
/// - `request_shutdown()` で新規の claim を止める
/// - `shutdown_and_join()` で実行中のタスクが終わるまで待つ
pub struct SchedulerHandle {
    scheduler: Arc<TaskScheduler>,
    dispatch_tx: watch::Sender<bool>,
    maintenance_tx: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
    maintenance: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn runner(&self) -> &Arc<TaskRunner> {
        self.scheduler.runner()
    }

    /// Stop claiming new tasks. In-flight executions keep running and keep
    /// their heartbeats.
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.dispatch_tx.send(true);
    }

    /// Stop dispatching, wait for every in-flight execution to release its
    /// permit, then stop the maintenance loops.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.dispatch.await;

        let total = u32::try_from(self.scheduler.max_concurrent).unwrap_or(u32::MAX);
        match self.scheduler.permits.acquire_many(total).await {
            Ok(all) => drop(all),
            Err(e) => error!(error = %e, "permit semaphore closed during drain"),
        }

        let _ = self.maintenance_tx.send(true);
        for join in self.maintenance {
            let _ = join.await;
        }
        info!("scheduler stopped");
    }
}

async fn run_every<F, Fut>(period: Duration, mut shutdown_rx: watch::Receiver<bool>, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            // sender が drop された場合も止める
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => f().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandlerError, TaskId, TaskRecord, TaskStatus, TaskType};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{Clock, FixedClock, TaskStore};
    use crate::typed::{HandlerRegistry, handler_fn};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use ulid::Ulid;

    async fn setup(
        max_concurrent: usize,
        tasks: usize,
    ) -> (Arc<InMemoryTaskStore>, Arc<Semaphore>, TaskScheduler) {
        let store = Arc::new(InMemoryTaskStore::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        for _ in 0..tasks {
            let now = clock.now();
            store
                .insert(TaskRecord::new_pending(
                    TaskId::from_ulid(Ulid::new()),
                    TaskType::new("blocking"),
                    json!({}),
                    now,
                    now,
                ))
                .await
                .unwrap();
        }

        let gate = Arc::new(Semaphore::new(0));
        let handler_gate = Arc::clone(&gate);
        let mut registry = HandlerRegistry::new();
        registry
            .register_dyn(
                TaskType::new("blocking"),
                Arc::new(handler_fn(move |_| {
                    let gate = Arc::clone(&handler_gate);
                    async move {
                        let permit = gate
                            .acquire()
                            .await
                            .map_err(|e| HandlerError::new(e.to_string()))?;
                        permit.forget();
                        Ok(())
                    }
                })),
            )
            .unwrap();

        let mut config = EngineConfig::default();
        config.max_concurrent_tasks = max_concurrent;
        let runner = TaskRunner::new(store.clone(), Arc::new(registry), &config)
            .unwrap()
            .with_clock(clock);
        (store, gate, TaskScheduler::new(Arc::new(runner), &config))
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn tick_launches_at_most_the_permit_budget() {
        let (store, gate, scheduler) = setup(2, 5).await;

        assert_eq!(scheduler.tick().await, 2);
        settle().await;
        assert_eq!(scheduler.runner().in_flight(), 2);
        assert_eq!(store.counts_by_status().await.unwrap().running, 2);

        // permit が無いので追加の claim はしない
        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(store.counts_by_status().await.unwrap().pending, 3);

        gate.add_permits(1);
        while scheduler.available_permits() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(scheduler.tick().await, 1);
        assert_eq!(store.counts_by_status().await.unwrap().running, 2);
        assert_eq!(store.counts_by_status().await.unwrap().done, 1);

        gate.add_permits(4);
        while store.counts_by_status().await.unwrap().pending > 0 {
            scheduler.tick().await;
            tokio::task::yield_now().await;
        }
        while !store.counts_by_status().await.unwrap().is_drained() {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.counts_by_status().await.unwrap().done, 5);
    }

    #[tokio::test]
    async fn tick_on_empty_queue_launches_nothing() {
        let (_store, _gate, scheduler) = setup(3, 0).await;
        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(scheduler.available_permits(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_tasks() {
        let (store, gate, scheduler) = setup(2, 2).await;
        let handle = scheduler.spawn();

        while store.counts_by_status().await.unwrap().running < 2 {
            tokio::task::yield_now().await;
        }

        let runner = Arc::clone(handle.runner());
        let stopping = tokio::spawn(handle.shutdown_and_join());
        settle().await;
        assert!(!stopping.is_finished());

        gate.add_permits(2);
        stopping.await.unwrap();

        assert_eq!(runner.in_flight(), 0);
        let counts = store.counts_by_status().await.unwrap();
        assert_eq!(counts.done, 2);
        assert_eq!(
            store.all().await.iter().filter(|r| r.status == TaskStatus::Done).count(),
            2
        );
    }
}
