//! Ports - 抽象化レイヤー
//!
//! エンジンが外部に依存する境界をここに集める。
//! 各 trait は実装の詳細（SQLite, メモリ, イベントバス）を隠蔽する。

pub mod clock;
pub mod event_publisher;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_publisher::{EventDelivery, EventPublisher};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::TaskStore;
