//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `expect_tasks()` で期待される task_type を宣言
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」と設定値をチェック
//! - 不足や不正な設定があれば起動前にエラーを返す

use std::sync::Arc;

use super::publisher::TaskPublisher;
use super::runner::TaskRunner;
use super::scheduler::{SchedulerHandle, TaskScheduler};
use crate::config::EngineConfig;
use crate::domain::{SpindleError, TaskType};
use crate::impls::NoopEventPublisher;
use crate::ports::{Clock, EventPublisher, IdGenerator, SystemClock, TaskStore, UlidGenerator};
use crate::typed::{DynHandler, Handler, HandlerRegistry, Task};

/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new(store)
///     .config(EngineConfig::from_env()?)
///     .register::<SendEmail, _>(SendEmailHandler)?
///     .expect_tasks(&["send-email"])
///     .build()?;
/// let scheduler = engine.start();
/// ```
pub struct EngineBuilder {
    store: Arc<dyn TaskStore>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    events: Arc<dyn EventPublisher>,
    registry: HandlerRegistry,
    expected_tasks: Option<Vec<String>>,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            ids: None,
            events: Arc::new(NoopEventPublisher),
            registry: HandlerRegistry::new(),
            expected_tasks: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to a ULID generator driven by the configured clock.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, SpindleError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn register_dyn(
        mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn DynHandler>,
    ) -> Result<Self, SpindleError> {
        self.registry.register_dyn(task_type.into(), handler)?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Engine, SpindleError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(SpindleError::MissingTaskTypes(missing_tasks));
            }
        }

        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&self.clock))));
        let runner = TaskRunner::new(
            Arc::clone(&self.store),
            Arc::new(self.registry),
            &self.config,
        )?
        .with_clock(Arc::clone(&self.clock))
        .with_id_generator(Arc::clone(&ids))
        .with_event_publisher(self.events);
        let publisher = TaskPublisher::new(Arc::clone(&self.store), self.clock, ids);

        Ok(Engine {
            store: self.store,
            config: self.config,
            publisher,
            runner: Arc::new(runner),
        })
    }
}

/// A wired engine: publish through `publisher()`, run through `start()`.
pub struct Engine {
    store: Arc<dyn TaskStore>,
    config: EngineConfig,
    publisher: TaskPublisher,
    runner: Arc<TaskRunner>,
}

impl Engine {
    pub fn publisher(&self) -> &TaskPublisher {
        &self.publisher
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Scheduler over this engine's runner, not yet started. Useful for
    /// driving ticks by hand.
    pub fn scheduler(&self) -> TaskScheduler {
        TaskScheduler::new(Arc::clone(&self.runner), &self.config)
    }

    /// Spawn the dispatch, heartbeat and stall-recovery loops.
    pub fn start(&self) -> SchedulerHandle {
        self.scheduler().spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HandlerError;
    use crate::impls::InMemoryTaskStore;
    use crate::typed::handler_fn;
    use crate::typed::task::fixtures::{RebuildIndex, SendEmail};
    use async_trait::async_trait;

    struct SendEmailHandler;

    #[async_trait]
    impl Handler<SendEmail> for SendEmailHandler {
        async fn handle(&self, _task: SendEmail) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn builder() -> EngineBuilder {
        EngineBuilder::new(Arc::new(InMemoryTaskStore::new()))
    }

    #[test]
    fn test_build_success() {
        let engine = builder()
            .register::<SendEmail, _>(SendEmailHandler)
            .unwrap()
            .expect_tasks(&[SendEmail::TYPE])
            .build();
        assert!(engine.is_ok());
    }

    #[test]
    fn test_build_missing_task_types() {
        let engine = builder()
            .register::<SendEmail, _>(SendEmailHandler)
            .unwrap()
            .expect_tasks(&[SendEmail::TYPE, RebuildIndex::TYPE])
            .build();
        assert!(matches!(
            engine,
            Err(SpindleError::MissingTaskTypes(missing)) if missing == vec![RebuildIndex::TYPE.to_string()]
        ));
    }

    #[test]
    fn test_build_no_expect_tasks() {
        let engine = builder()
            .register_dyn("flaky", Arc::new(handler_fn(|_| async { Ok(()) })))
            .unwrap()
            .build();
        assert!(engine.is_ok());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.max_concurrent_tasks = 0;
        let engine = builder().config(config).build();
        assert!(matches!(engine, Err(SpindleError::Config(_))));
    }

    #[tokio::test]
    async fn test_published_task_runs_through_engine() {
        let engine = builder()
            .register::<SendEmail, _>(SendEmailHandler)
            .unwrap()
            .build()
            .unwrap();

        let id = engine
            .publisher()
            .publish_task(&SendEmail {
                to: "a@b.com".into(),
            })
            .await
            .unwrap();
        let report = engine.runner().run_task().await.unwrap();

        assert_eq!(report.task_id, id);
        assert!(engine.store().counts_by_status().await.unwrap().is_drained());
    }
}
