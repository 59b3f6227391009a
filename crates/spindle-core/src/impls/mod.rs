//! Impls - ports の実装
//!
//! - **InMemoryTaskStore**: テスト・単一プロセス用の正本
//! - **SqliteTaskStore**: ファイル共有で複数プロセスから使える正本（feature `sqlite`）
//! - **NoopEventPublisher** / **BroadcastEventPublisher**: 完了イベントの送出先

pub mod events;
pub mod memory_store;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use self::events::{BroadcastEventPublisher, NoopEventPublisher};
pub use self::memory_store::InMemoryTaskStore;
#[cfg(feature = "sqlite")]
pub use self::sqlite_store::SqliteTaskStore;
