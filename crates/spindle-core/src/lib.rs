//! spindle-core
//!
//! Durable task execution engine: a persisted work queue whose tasks are
//! claimed under a lease, executed with bounded concurrency, retried with
//! back-off, dead-lettered after a retention window and recovered when a
//! runner stops heartbeating.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, errors, events）
//! - **ports**: 抽象化レイヤー（TaskStore, EventPublisher, Clock, IdGenerator）
//! - **policy**: back-off と dead queue の判定（純粋関数）
//! - **typed**: 型付き Task API（Task trait, Handler trait, HandlerRegistry）
//! - **app**: アプリケーションロジック（builder, publisher, runner, scheduler, status）
//! - **impls**: 実装（InMemoryTaskStore, SqliteTaskStore, event publishers）
//! - **config**: EngineConfig（serde / 環境変数）
//! - **observability**: tracing の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod policy;
pub mod ports;
pub mod typed;

pub use app::{
    Disposition, Engine, EngineBuilder, QueueCounts, RunReport, SchedulerHandle, TaskPublisher,
    TaskRunner, TaskScheduler,
};
pub use config::EngineConfig;
pub use domain::{
    ErrorKind, HandlerError, LeaseId, SpindleError, TaskEvent, TaskId, TaskRecord, TaskStatus,
    TaskType,
};
pub use typed::{Handler, HandlerRegistry, Task, handler_fn};
