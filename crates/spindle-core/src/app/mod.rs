//! App - アプリケーション層
//!
//! ports を組み合わせてエンジンの振る舞いを実装する。
//!
//! # 主要コンポーネント
//! - **EngineBuilder / Engine**: 構築とワイヤリング
//! - **TaskPublisher**: タスクの投入
//! - **TaskRunner**: claim → handle → done / retry / dead、heartbeat、stall recovery
//! - **TaskScheduler**: dispatch / heartbeat / stall recovery の定期ループ
//! - **QueueCounts**: status ごとの件数

pub mod builder;
pub mod publisher;
pub mod runner;
pub mod scheduler;
pub mod status;

pub use self::builder::{Engine, EngineBuilder};
pub use self::publisher::TaskPublisher;
pub use self::runner::{ClaimedTask, Disposition, RunReport, TaskRunner};
pub use self::scheduler::{SchedulerHandle, TaskScheduler};
pub use self::status::QueueCounts;
