//! EventPublisher implementations.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::{SpindleError, TaskEvent};
use crate::ports::EventPublisher;

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _event: TaskEvent) -> Result<(), SpindleError> {
        Ok(())
    }
}

/// In-process fan-out over a tokio broadcast channel.
///
/// Publishing with no live subscriber is not an error; the event is simply
/// dropped. Slow subscribers lag and lose the oldest events.
#[derive(Debug, Clone)]
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<TaskEvent>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: TaskEvent) -> Result<(), SpindleError> {
        // 受信者ゼロは正常
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskType};
    use chrono::Utc;
    use ulid::Ulid;

    fn completed() -> TaskEvent {
        TaskEvent::Completed {
            task_id: TaskId::from_ulid(Ulid::new()),
            task_type: TaskType::new("send-email"),
            attempts: 0,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let publisher = BroadcastEventPublisher::new(8);
        let mut rx = publisher.subscribe();

        let event = completed();
        publisher.publish(event.clone()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_ok() {
        let publisher = BroadcastEventPublisher::default();
        assert!(publisher.publish(completed()).await.is_ok());
        assert!(NoopEventPublisher.publish(completed()).await.is_ok());
    }
}
