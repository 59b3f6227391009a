//! EventPublisher port - 完了イベントの送出先
//!
//! The runner only knows `publish`. Whether the runner waits for it is
//! decided by `EventDelivery`, not by implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{SpindleError, TaskEvent};

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: TaskEvent) -> Result<(), SpindleError>;
}

/// How the runner hands completion events to the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDelivery {
    /// Await `publish` before `run_task` returns.
    #[default]
    Synchronous,
    /// Spawn `publish` and return immediately.
    FireAndForget,
}

impl std::str::FromStr for EventDelivery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synchronous" | "sync" => Ok(EventDelivery::Synchronous),
            "fire_and_forget" | "async" => Ok(EventDelivery::FireAndForget),
            other => Err(format!(
                "unknown event delivery '{other}'. expected one of: synchronous, fire_and_forget"
            )),
        }
    }
}
