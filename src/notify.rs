//! Status change broadcasting
//!
//! The supervisor publishes every `Stopped`/`Running` transition through a
//! [`StatusNotifier`]. Subscribers receive events on a broadcast channel;
//! dropping the receiver unsubscribes. Delivery is best effort: a subscriber
//! that falls behind by more than the channel capacity loses the oldest
//! events and should re-query the supervisor for authoritative status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of events buffered per subscriber
pub const DEFAULT_CAPACITY: usize = 64;

/// Status of a managed server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// No supervised process
    Stopped,
    /// A supervised process is alive
    Running,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Stopped => "stopped",
            Status::Running => "running",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub server_id: String,
    pub status: Status,
    pub at: DateTime<Utc>,
}

/// Cloneable publisher handle
#[derive(Debug, Clone)]
pub struct StatusNotifier {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Broadcast a transition; having no subscribers is not an error
    pub fn publish(&self, server_id: &str, status: Status) {
        let event = StatusEvent {
            server_id: server_id.to_string(),
            status,
            at: Utc::now(),
        };
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(id = server_id, %status, delivered, "Status event published");
    }
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let notifier = StatusNotifier::default();
        assert_eq!(notifier.subscriber_count(), 0);
        notifier.publish("blog", Status::Running);
    }

    #[tokio::test]
    async fn test_events_reach_every_subscriber_in_order() {
        let notifier = StatusNotifier::default();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.publish("blog", Status::Running);
        notifier.publish("blog", Status::Stopped);

        for rx in [&mut first, &mut second] {
            let a = rx.recv().await.unwrap();
            let b = rx.recv().await.unwrap();
            assert_eq!((a.server_id.as_str(), a.status), ("blog", Status::Running));
            assert_eq!((b.server_id.as_str(), b.status), ("blog", Status::Stopped));
            assert!(a.at <= b.at);
        }
    }

    #[tokio::test]
    async fn test_dropping_receiver_unsubscribes() {
        let notifier = StatusNotifier::default();
        let rx = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);

        drop(rx);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_and_publish() {
        let notifier = StatusNotifier::new(1024);
        let publisher = notifier.clone();

        let task = tokio::spawn(async move {
            for _ in 0..100 {
                publisher.publish("a", Status::Running);
                tokio::task::yield_now().await;
            }
        });

        let mut receivers = Vec::new();
        for _ in 0..10 {
            receivers.push(notifier.subscribe());
            tokio::task::yield_now().await;
        }
        task.await.unwrap();

        for mut rx in receivers {
            while let Ok(event) = rx.try_recv() {
                assert_eq!(event.server_id, "a");
            }
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_told() {
        let notifier = StatusNotifier::new(2);
        let mut rx = notifier.subscribe();

        for _ in 0..5 {
            notifier.publish("blog", Status::Running);
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Running.to_string(), "running");
        assert_eq!(Status::Stopped.to_string(), "stopped");
        assert_eq!(
            serde_json::to_string(&Status::Running).unwrap(),
            "\"running\""
        );
    }
}
