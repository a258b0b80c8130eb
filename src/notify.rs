//! Cross-process system events.
//!
//! Events tell other processes that cached queue state is out of date. They
//! are best effort: a lost event only delays a cache refresh, so nothing
//! depends on them for correctness.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::keys::{KeySchema, QueueName};
use crate::store::{Store, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SystemEvent {
    QueueCreated { queue: QueueName },
    QueueDeleted { queue: QueueName },
    QueueUpdated { queue: QueueName },
    ConsumerGroupCreated { queue: QueueName, group: String },
    ConsumerGroupDeleted { queue: QueueName, group: String },
}

impl SystemEvent {
    pub fn queue(&self) -> &QueueName {
        match self {
            SystemEvent::QueueCreated { queue }
            | SystemEvent::QueueDeleted { queue }
            | SystemEvent::QueueUpdated { queue }
            | SystemEvent::ConsumerGroupCreated { queue, .. }
            | SystemEvent::ConsumerGroupDeleted { queue, .. } => queue,
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn Store>,
}

impl Notifier {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Publish `event`. Failures are logged and otherwise ignored.
    pub async fn notify(&self, event: SystemEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode system event");
                return;
            }
        };
        match self.store.publish(&KeySchema::events_channel(), &payload).await {
            Ok(()) => debug!(event = ?event, "System event published"),
            Err(e) => warn!(error = %e, event = ?event, "Failed to publish system event"),
        }
    }

    pub async fn subscribe(&self) -> StoreResult<EventStream> {
        let receiver = self.store.subscribe(&KeySchema::events_channel()).await?;
        Ok(EventStream { receiver })
    }
}

/// Decoded system events from a subscription.
pub struct EventStream {
    receiver: mpsc::Receiver<String>,
}

impl EventStream {
    /// Next event, skipping payloads that do not decode. `None` once the
    /// subscription is closed.
    pub async fn next(&mut self) -> Option<SystemEvent> {
        while let Some(payload) = self.receiver.recv().await {
            match serde_json::from_str(&payload) {
                Ok(event) => return Some(event),
                Err(e) => warn!(error = %e, "Ignoring undecodable system event"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_event_wire_format() {
        let queue = QueueName::new("shop", "orders").unwrap();
        let event = SystemEvent::ConsumerGroupCreated {
            queue: queue.clone(),
            group: "billing".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"consumerGroupCreated\""));

        let back: SystemEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.queue(), &queue);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let notifier = Notifier::new(Arc::new(MemoryStore::new()));
        let mut events = notifier.subscribe().await.unwrap();

        let queue = QueueName::new("shop", "orders").unwrap();
        notifier
            .store
            .publish(&KeySchema::events_channel(), "garbage")
            .await
            .unwrap();
        notifier
            .notify(SystemEvent::QueueUpdated {
                queue: queue.clone(),
            })
            .await;

        assert_eq!(events.next().await, Some(SystemEvent::QueueUpdated { queue }));
    }
}
