//! Atomic message transitions.
//!
//! Every state change of a message is one atomic store operation: either a
//! server-side script that checks its preconditions first (publish, schedule,
//! requeue, delay, settle, activate) or a [`Transaction`] (processing queue
//! bookkeeping). A [`BrokerEvent`] is broadcast only after
//! the store accepted the change.
//!
//! Store errors are returned unchanged; retrying them is up to the caller.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::ArchiveConfig;
use crate::keys::{KeyError, KeySchema, ProcessingQueue, QueueName};
use crate::message::schedule;
use crate::message::{
    now_ms, retry_decision, DeadLetterCause, DeliverySettings, Message, MessageEnvelope,
    MessageError, MessageStatus, RetryAction, RetryCause,
};
use crate::queue::{self, QueueError, QueueParams, QueueType, RateLimit};
use crate::store::scripts::reason;
use crate::store::{ScriptCall, ScriptName, ScriptReply, Store, StoreError, Transaction};

/// Wait after an empty priority pop. Sorted sets have no blocking pop.
pub const PRIORITY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Publishing to a pub/sub queue that has no consumer group.
pub const NO_CONSUMER_GROUPS: &str = "NO_CONSUMER_GROUPS";

/// A schedule that yields no fire time at all.
pub const SCHEDULE_EXHAUSTED: &str = "SCHEDULE_EXHAUSTED";

const BROKER_EVENT_CAPACITY: usize = 1024;

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("message not published: {0}")]
    NotPublished(String),

    #[error("message not scheduled: {0}")]
    NotScheduled(String),

    #[error("message not requeued: {0}")]
    Requeue(String),

    #[error("message not settled: {0}")]
    NotSettled(String),

    #[error("queue {0} not found")]
    QueueNotFound(QueueName),

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] MessageError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Queue(QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<QueueError> for BrokerError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::NotFound(queue) => BrokerError::QueueNotFound(queue),
            QueueError::Store(e) => BrokerError::Store(e),
            other => BrokerError::Queue(other),
        }
    }
}

/// A committed transition.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Published { queue: QueueName, id: Uuid },
    Scheduled { queue: QueueName, id: Uuid, fire_at: i64 },
    Acknowledged { queue: QueueName, id: Uuid },
    Requeued { queue: QueueName, id: Uuid, attempts: u32 },
    Delayed { queue: QueueName, id: Uuid, due_at: i64 },
    DeadLettered { queue: QueueName, id: Uuid, cause: DeadLetterCause },
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub defaults: DeliverySettings,
    pub acknowledged: ArchiveConfig,
    pub dead_lettered: ArchiveConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let store = crate::config::MessageStoreConfig::default();
        Self {
            defaults: DeliverySettings::default(),
            acknowledged: store.acknowledged,
            dead_lettered: store.dead_lettered,
        }
    }
}

impl From<&crate::config::RedqConfig> for BrokerConfig {
    fn from(config: &crate::config::RedqConfig) -> Self {
        Self {
            defaults: config.messages.defaults,
            acknowledged: config.messages.store.acknowledged,
            dead_lettered: config.messages.store.dead_lettered,
        }
    }
}

#[derive(Clone)]
pub struct Broker {
    store: Arc<dyn Store>,
    keys: KeySchema,
    config: Arc<BrokerConfig>,
    events: broadcast::Sender<BrokerEvent>,
}

impl Broker {
    pub fn new(store: Arc<dyn Store>, keys: KeySchema, config: BrokerConfig) -> Self {
        let (events, _) = broadcast::channel(BROKER_EVENT_CAPACITY);
        Self {
            store,
            keys,
            config: Arc::new(config),
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn keys(&self) -> &KeySchema {
        &self.keys
    }

    /// Committed transitions, for metrics and observers.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: BrokerEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub async fn queue_params(&self, queue: &QueueName) -> Result<QueueParams, BrokerError> {
        Ok(queue::load_params(self.store.as_ref(), queue).await?)
    }

    /// Publish `message` to `queue` (`name` or `name@namespace`).
    ///
    /// On a pub/sub queue every consumer group gets its own copy with its
    /// own id. Messages with scheduling parameters are parked in the
    /// scheduled set, everything else goes straight to pending. Returns the
    /// ids of the created messages.
    #[instrument(skip_all, fields(queue = %queue))]
    pub async fn publish(&self, queue: &str, message: Message) -> Result<Vec<Uuid>, BrokerError> {
        message.validate()?;
        let queue = self.keys.queue(queue)?;
        let params = self.queue_params(&queue).await?;
        let settings = self
            .config
            .defaults
            .resolve(&message.overrides, &params.defaults);

        let groups: Vec<Option<String>> = if params.is_pub_sub() {
            let mut groups = self.store.smembers(&queue.consumer_groups()).await?;
            if groups.is_empty() {
                return Err(BrokerError::NotPublished(NO_CONSUMER_GROUPS.to_string()));
            }
            groups.sort();
            groups.into_iter().map(Some).collect()
        } else {
            vec![None]
        };

        let schedulable = message.schedule.is_schedulable();
        let mut ids = Vec::with_capacity(groups.len());
        for group in groups {
            let envelope = MessageEnvelope::new(queue.clone(), group, message.clone(), settings);
            let id = envelope.id;
            if schedulable {
                self.schedule(envelope).await?;
            } else {
                self.enqueue(envelope).await?;
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Park a message in the scheduled set until its first fire time.
    pub async fn schedule(&self, mut envelope: MessageEnvelope) -> Result<i64, BrokerError> {
        let fire_at = schedule::next_occurrence(
            &envelope.message.schedule,
            &mut envelope.state,
            now_ms(),
        )?
        .ok_or_else(|| BrokerError::NotScheduled(SCHEDULE_EXHAUSTED.to_string()))?;
        envelope.state.status = MessageStatus::Scheduled;
        envelope.state.scheduled_at = Some(fire_at);

        let queue = &envelope.queue;
        let call = ScriptCall::new(ScriptName::Schedule)
            .key(queue.properties())
            .key(queue.scheduled())
            .key(envelope.key())
            .key(queue.consumer_groups())
            .arg(envelope.id)
            .arg(envelope.to_json().map_err(StoreError::from)?)
            .arg(fire_at)
            .arg(envelope.priority_arg())
            .arg(envelope.consumer_group.clone().unwrap_or_default());

        match self.store.eval(call).await?.into_transition() {
            Ok(true) => {}
            Ok(false) => return Err(BrokerError::NotScheduled("NIL".to_string())),
            Err(reason) => return Err(BrokerError::NotScheduled(reason)),
        }

        debug!(message_id = %envelope.id, fire_at = fire_at, "Message scheduled");
        self.emit(BrokerEvent::Scheduled {
            queue: envelope.queue.clone(),
            id: envelope.id,
            fire_at,
        });
        Ok(fire_at)
    }

    /// Put a message into its pending structure.
    pub async fn enqueue(&self, mut envelope: MessageEnvelope) -> Result<(), BrokerError> {
        envelope.state.status = MessageStatus::Pending;
        envelope.state.published_at = Some(now_ms());

        let queue = &envelope.queue;
        let group = envelope.consumer_group.as_deref();
        let call = ScriptCall::new(ScriptName::Publish)
            .key(queue.properties())
            .key(queue.pending(group))
            .key(queue.priority_pending(group))
            .key(envelope.key())
            .key(queue.consumer_groups())
            .key(queue.priority_sequence())
            .arg(envelope.id)
            .arg(envelope.to_json().map_err(StoreError::from)?)
            .arg(envelope.priority_arg())
            .arg(group.unwrap_or_default());

        match self.store.eval(call).await?.into_transition() {
            Ok(true) => {}
            Ok(false) => return Err(BrokerError::NotPublished("NIL".to_string())),
            Err(reason) => return Err(BrokerError::NotPublished(reason)),
        }

        debug!(queue = %envelope.queue, message_id = %envelope.id, "Message published");
        self.emit(BrokerEvent::Published {
            queue: envelope.queue.clone(),
            id: envelope.id,
        });
        Ok(())
    }

    /// Move the next message into `pq` and return it.
    ///
    /// `store` must be a [`Store::dedicated`] handle: list queues block on it
    /// until a message arrives or `timeout` passes (`None` waits forever).
    /// Priority queues poll instead and return `None` after a
    /// [`PRIORITY_POLL_INTERVAL`] pause when empty.
    pub async fn dequeue(
        &self,
        store: &dyn Store,
        pq: &ProcessingQueue,
        queue_type: QueueType,
        timeout: Option<Duration>,
    ) -> Result<Option<MessageEnvelope>, BrokerError> {
        let id = if queue_type == QueueType::Priority {
            let call = ScriptCall::new(ScriptName::PopPriority)
                .key(pq.priority_pending())
                .key(pq.key())
                .arg(pq.queue.message_prefix());
            match store.eval(call).await? {
                ScriptReply::Text(id) => id,
                ScriptReply::Nil => {
                    tokio::time::sleep(PRIORITY_POLL_INTERVAL).await;
                    return Ok(None);
                }
                other => {
                    return Err(BrokerError::Store(StoreError::UnexpectedReply {
                        script: ScriptName::PopPriority.to_string(),
                        reply: format!("{other:?}"),
                    }))
                }
            }
        } else {
            let Some(id) = store.blocking_move(&pq.pending(), &pq.key(), timeout).await? else {
                return Ok(None);
            };
            let Ok(uuid) = Uuid::parse_str(&id) else {
                return self.drop_stray_id(pq, &id).await;
            };
            let mut tx = Transaction::new();
            tx.hset(pq.queue.message(&uuid), "status", MessageStatus::Processing.as_str());
            self.store.commit(tx).await?;
            id
        };

        let Ok(uuid) = Uuid::parse_str(&id) else {
            return self.drop_stray_id(pq, &id).await;
        };
        match self.load(&pq.queue, &uuid).await? {
            Some(envelope) => {
                debug!(queue = %pq.queue, message_id = %uuid, "Message dequeued");
                Ok(Some(envelope))
            }
            None => self.drop_stray_id(pq, &id).await,
        }
    }

    /// Remove an id whose message no longer exists from `pq`.
    async fn drop_stray_id(
        &self,
        pq: &ProcessingQueue,
        id: &str,
    ) -> Result<Option<MessageEnvelope>, BrokerError> {
        warn!(processing_queue = %pq, id = %id, "Dropping id without a message");
        let mut tx = Transaction::new();
        tx.lrem(pq.key(), id);
        if let Ok(uuid) = Uuid::parse_str(id) {
            tx.del(pq.queue.message(&uuid));
        }
        self.store.commit(tx).await?;
        Ok(None)
    }

    pub async fn load(
        &self,
        queue: &QueueName,
        id: &Uuid,
    ) -> Result<Option<MessageEnvelope>, BrokerError> {
        let fields = self.store.hgetall(&queue.message(id)).await?;
        Ok(MessageEnvelope::from_fields(&fields).map_err(StoreError::from)?)
    }

    /// Handling succeeded: remove the message from `pq` and archive it.
    pub async fn acknowledge(
        &self,
        pq: &ProcessingQueue,
        envelope: &MessageEnvelope,
    ) -> Result<(), BrokerError> {
        let mut envelope = envelope.clone();
        envelope.state.status = MessageStatus::Acknowledged;
        envelope.state.acknowledged_at = Some(now_ms());

        self.settle(
            pq,
            &envelope,
            &self.config.acknowledged,
            envelope.queue.acknowledged(),
        )
        .await?;

        debug!(queue = %envelope.queue, message_id = %envelope.id, "Message acknowledged");
        self.emit(BrokerEvent::Acknowledged {
            queue: envelope.queue,
            id: envelope.id,
        });
        Ok(())
    }

    /// Handling failed: dead-letter, delay or requeue the message as the
    /// retry decision says.
    #[instrument(skip_all, fields(message_id = %envelope.id, cause = ?cause))]
    pub async fn retry(
        &self,
        pq: &ProcessingQueue,
        envelope: &MessageEnvelope,
        cause: RetryCause,
    ) -> Result<RetryAction, BrokerError> {
        let now = now_ms();
        let mut envelope = envelope.clone();
        if cause == RetryCause::TtlExpired {
            envelope.state.expired = true;
        }
        envelope.state.last_retry_cause = Some(cause);

        let action = retry_decision(&envelope.retry_input(now));
        match action {
            RetryAction::DeadLetter(dead_cause) => {
                self.dead_letter(pq, envelope, dead_cause).await?;
            }
            RetryAction::Delay { delay_ms } => {
                let due_at = now.saturating_add(delay_ms as i64);
                envelope.state.attempts += 1;
                envelope.state.status = MessageStatus::Delayed;

                let call = ScriptCall::new(ScriptName::Delay)
                    .key(envelope.queue.properties())
                    .key(pq.key())
                    .key(envelope.queue.delayed())
                    .key(envelope.key())
                    .arg(envelope.id)
                    .arg(envelope.to_json().map_err(StoreError::from)?)
                    .arg(due_at);
                transition(self.store.eval(call).await?)?;

                info!(attempts = envelope.state.attempts, due_at = due_at, "Message delayed");
                self.emit(BrokerEvent::Delayed {
                    queue: envelope.queue,
                    id: envelope.id,
                    due_at,
                });
            }
            RetryAction::Requeue => {
                envelope.state.attempts += 1;
                self.requeue(pq, &envelope).await?;
                info!(attempts = envelope.state.attempts, "Message requeued");
                self.emit(BrokerEvent::Requeued {
                    queue: envelope.queue,
                    id: envelope.id,
                    attempts: envelope.state.attempts,
                });
            }
        }
        Ok(action)
    }

    async fn requeue(&self, pq: &ProcessingQueue, envelope: &MessageEnvelope) -> Result<(), BrokerError> {
        let mut envelope = envelope.clone();
        envelope.state.status = MessageStatus::Pending;

        let queue = &envelope.queue;
        let group = envelope.consumer_group.as_deref();
        let call = ScriptCall::new(ScriptName::Requeue)
            .key(queue.properties())
            .key(pq.key())
            .key(queue.pending(group))
            .key(queue.priority_pending(group))
            .key(envelope.key())
            .key(queue.priority_sequence())
            .arg(envelope.id)
            .arg(envelope.to_json().map_err(StoreError::from)?)
            .arg(envelope.priority_arg());
        transition(self.store.eval(call).await?)
    }

    /// Remove the message from `pq` for good and archive it as dead.
    pub async fn dead_letter(
        &self,
        pq: &ProcessingQueue,
        mut envelope: MessageEnvelope,
        cause: DeadLetterCause,
    ) -> Result<(), BrokerError> {
        envelope.state.status = MessageStatus::DeadLettered;
        envelope.state.dead_letter_cause = Some(cause);
        envelope.state.dead_lettered_at = Some(now_ms());

        self.settle(
            pq,
            &envelope,
            &self.config.dead_lettered,
            envelope.queue.dead_lettered(),
        )
        .await?;

        warn!(
            queue = %envelope.queue,
            message_id = %envelope.id,
            cause = ?cause,
            "Message dead-lettered"
        );
        self.emit(BrokerEvent::DeadLettered {
            queue: envelope.queue,
            id: envelope.id,
            cause,
        });
        Ok(())
    }

    /// Remove the message from `pq` and delete it, archiving it in `archive`
    /// when the archive is enabled. Fails with `MESSAGE_NOT_PROCESSING` once
    /// the id has left `pq`, e.g. after the GC handed it to someone else.
    async fn settle(
        &self,
        pq: &ProcessingQueue,
        envelope: &MessageEnvelope,
        config: &ArchiveConfig,
        archive: String,
    ) -> Result<(), BrokerError> {
        let entry = if config.enabled {
            envelope.to_json().map_err(StoreError::from)?
        } else {
            String::new()
        };
        let call = ScriptCall::new(ScriptName::Settle)
            .key(pq.key())
            .key(envelope.key())
            .key(archive)
            .arg(envelope.id)
            .arg(entry)
            .arg(config.queue_size)
            .arg(config.expire_ms);

        match self.store.eval(call).await?.into_transition() {
            Ok(true) => Ok(()),
            Ok(false) => Err(BrokerError::NotSettled(reason::MESSAGE_NOT_PROCESSING.to_string())),
            Err(reason) => Err(BrokerError::NotSettled(reason)),
        }
    }

    /// Move a due message from `source` (the scheduled or delayed set of its
    /// queue) to pending. With `next`, park the following occurrence of a
    /// periodic message in the same step.
    ///
    /// Returns false if the message was no longer in `source`.
    pub async fn activate(
        &self,
        source: &str,
        envelope: &MessageEnvelope,
        next: Option<&MessageEnvelope>,
    ) -> Result<bool, BrokerError> {
        let mut envelope = envelope.clone();
        envelope.state.status = MessageStatus::Pending;
        envelope.state.published_at.get_or_insert_with(now_ms);

        let queue = &envelope.queue;
        let group = envelope.consumer_group.as_deref();
        let mut call = ScriptCall::new(ScriptName::Activate)
            .key(queue.properties())
            .key(source)
            .key(queue.pending(group))
            .key(queue.priority_pending(group))
            .key(envelope.key())
            .key(queue.priority_sequence());
        call = match next {
            Some(next) => call
                .key(next.key())
                .arg(envelope.id)
                .arg(envelope.to_json().map_err(StoreError::from)?)
                .arg(envelope.priority_arg())
                .arg(next.id)
                .arg(next.to_json().map_err(StoreError::from)?)
                .arg(next.state.scheduled_at.unwrap_or_default()),
            None => call
                .key(envelope.key())
                .arg(envelope.id)
                .arg(envelope.to_json().map_err(StoreError::from)?)
                .arg(envelope.priority_arg())
                .arg("")
                .arg("")
                .arg(""),
        };

        let activated = match self.store.eval(call).await?.into_transition() {
            Ok(activated) => activated,
            Err(reason) => return Err(BrokerError::NotPublished(reason)),
        };
        if activated {
            debug!(queue = %envelope.queue, message_id = %envelope.id, "Message activated");
            self.emit(BrokerEvent::Published {
                queue: envelope.queue.clone(),
                id: envelope.id,
            });
            if let Some(next) = next {
                self.emit(BrokerEvent::Scheduled {
                    queue: next.queue.clone(),
                    id: next.id,
                    fire_at: next.state.scheduled_at.unwrap_or_default(),
                });
            }
        }
        Ok(activated)
    }

    /// Record `pq` in the global and per-queue processing queue indexes.
    pub async fn register_processing_queue(&self, pq: &ProcessingQueue) -> Result<(), BrokerError> {
        let key = pq.key();
        let mut tx = Transaction::new();
        tx.hset(KeySchema::processing_queues(), &key, &pq.consumer_id)
            .hset(pq.queue.processing_queues(), &key, &pq.consumer_id);
        self.store.commit(tx).await?;
        debug!(processing_queue = %key, "Processing queue registered");
        Ok(())
    }

    /// Delete `pq` and its index entries.
    pub async fn unregister_processing_queue(&self, pq: &ProcessingQueue) -> Result<(), BrokerError> {
        let key = pq.key();
        let mut tx = Transaction::new();
        tx.del(&key)
            .hdel(KeySchema::processing_queues(), &key)
            .hdel(pq.queue.processing_queues(), &key);
        self.store.commit(tx).await?;
        debug!(processing_queue = %key, "Processing queue removed");
        Ok(())
    }

    /// Return every message still in `pq` to pending without counting an
    /// attempt. Used by a consumer stopping cleanly.
    pub async fn release_unprocessed(&self, pq: &ProcessingQueue) -> Result<usize, BrokerError> {
        let mut released = 0;
        for id in self.store.lrange(&pq.key(), 0, -1).await? {
            let envelope = match Uuid::parse_str(&id) {
                Ok(uuid) => self.load(&pq.queue, &uuid).await?,
                Err(_) => None,
            };
            match envelope {
                Some(envelope) => {
                    self.requeue(pq, &envelope).await?;
                    released += 1;
                }
                None => {
                    self.drop_stray_id(pq, &id).await?;
                }
            }
        }
        if released > 0 {
            info!(processing_queue = %pq, released = released, "Released unprocessed messages");
        }
        Ok(released)
    }

    /// Count one delivery against `limit`. Returns true when the window is
    /// already used up.
    pub async fn rate_limit_exceeded(
        &self,
        queue: &QueueName,
        limit: &RateLimit,
    ) -> Result<bool, BrokerError> {
        let call = ScriptCall::new(ScriptName::RateLimit)
            .key(queue.rate_limit())
            .arg(limit.limit)
            .arg(limit.interval_ms);
        Ok(self.store.eval(call).await?.is_truthy())
    }
}

fn transition(reply: ScriptReply) -> Result<(), BrokerError> {
    match reply.into_transition() {
        Ok(true) => Ok(()),
        Ok(false) => Err(BrokerError::Requeue(reason::MESSAGE_NOT_PROCESSING.to_string())),
        Err(reason) => Err(BrokerError::Requeue(reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DeliveryModel, QueueManager};
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Fixture {
        store: MemoryStore,
        broker: Broker,
        queues: QueueManager,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let config = BrokerConfig {
            acknowledged: ArchiveConfig::default(),
            ..BrokerConfig::default()
        };
        Fixture {
            broker: Broker::new(shared.clone(), KeySchema::new("shop").unwrap(), config),
            queues: QueueManager::new(shared),
            store,
        }
    }

    fn orders() -> QueueName {
        QueueName::new("shop", "orders").unwrap()
    }

    fn pq(consumer: &str) -> ProcessingQueue {
        ProcessingQueue::new(orders(), consumer, None)
    }

    async fn status(store: &MemoryStore, queue: &QueueName, id: &Uuid) -> Option<String> {
        store.hget(&queue.message(id), "status").await.unwrap()
    }

    const SHORT: Option<Duration> = Some(Duration::from_secs(1));

    #[tokio::test]
    async fn test_publish_to_missing_queue() {
        let f = fixture();
        let err = f.broker.publish("orders", Message::new(json!({}))).await;
        assert!(matches!(err, Err(BrokerError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_message() {
        let f = fixture();
        f.queues.create(&orders(), QueueParams::default()).await.unwrap();
        let err = f
            .broker
            .publish("orders", Message::new(json!({})).with_priority(9))
            .await;
        assert!(matches!(err, Err(BrokerError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_priority_mismatch_reasons() {
        let f = fixture();
        f.queues.create(&orders(), QueueParams::default()).await.unwrap();
        let err = f
            .broker
            .publish("orders", Message::new(json!({})).with_priority(3))
            .await
            .unwrap_err();
        assert!(
            matches!(err, BrokerError::NotPublished(ref r) if r == reason::PRIORITY_QUEUING_NOT_ENABLED)
        );

        let urgent = QueueName::new("shop", "urgent").unwrap();
        f.queues
            .create(&urgent, QueueParams::new(QueueType::Priority))
            .await
            .unwrap();
        let err = f
            .broker
            .publish("urgent", Message::new(json!({})))
            .await
            .unwrap_err();
        assert!(
            matches!(err, BrokerError::NotPublished(ref r) if r == reason::MESSAGE_PRIORITY_REQUIRED)
        );
    }

    #[tokio::test]
    async fn test_fifo_and_lifo_order() {
        let f = fixture();
        f.queues.create(&orders(), QueueParams::new(QueueType::Fifo)).await.unwrap();
        let stack = QueueName::new("shop", "stack").unwrap();
        f.queues.create(&stack, QueueParams::new(QueueType::Lifo)).await.unwrap();

        for n in 1..=2 {
            f.broker.publish("orders", Message::new(json!(n))).await.unwrap();
            f.broker.publish("stack", Message::new(json!(n))).await.unwrap();
        }

        let dedicated = f.store.dedicated();
        let fifo = f
            .broker
            .dequeue(dedicated.as_ref(), &pq("c-1"), QueueType::Fifo, SHORT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fifo.message.body, json!(1));

        let lifo_pq = ProcessingQueue::new(stack, "c-1", None);
        let lifo = f
            .broker
            .dequeue(dedicated.as_ref(), &lifo_pq, QueueType::Lifo, SHORT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lifo.message.body, json!(2));
    }

    #[tokio::test]
    async fn test_priority_order_with_insertion_tie_break() {
        let f = fixture();
        let urgent = QueueName::new("shop", "urgent").unwrap();
        f.queues
            .create(&urgent, QueueParams::new(QueueType::Priority))
            .await
            .unwrap();
        for (body, priority) in [("low", 1), ("high-a", 6), ("high-b", 6), ("top", 7)] {
            f.broker
                .publish("urgent", Message::new(json!(body)).with_priority(priority))
                .await
                .unwrap();
        }

        let pq = ProcessingQueue::new(urgent, "c-1", None);
        let dedicated = f.store.dedicated();
        let mut seen = Vec::new();
        for _ in 0..4 {
            let envelope = f
                .broker
                .dequeue(dedicated.as_ref(), &pq, QueueType::Priority, None)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(envelope.state.status, MessageStatus::Processing);
            f.broker.acknowledge(&pq, &envelope).await.unwrap();
            seen.push(envelope.message.body);
        }
        assert_eq!(seen, vec![json!("top"), json!("high-a"), json!("high-b"), json!("low")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_priority_pop_backs_off() {
        let f = fixture();
        let urgent = QueueName::new("shop", "urgent").unwrap();
        let pq = ProcessingQueue::new(urgent, "c-1", None);

        let started = tokio::time::Instant::now();
        let dedicated = f.store.dedicated();
        let got = f
            .broker
            .dequeue(dedicated.as_ref(), &pq, QueueType::Priority, None)
            .await
            .unwrap();
        assert!(got.is_none());
        assert!(started.elapsed() >= PRIORITY_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn test_message_lives_in_exactly_one_structure() {
        let f = fixture();
        f.queues.create(&orders(), QueueParams::default()).await.unwrap();
        let ids = f.broker.publish("orders", Message::new(json!({}))).await.unwrap();
        let id = ids[0];
        let pending = orders().pending(None);
        let processing = pq("c-1").key();

        assert_eq!(f.store.lrange(&pending, 0, -1).await.unwrap(), vec![id.to_string()]);
        assert_eq!(status(&f.store, &orders(), &id).await.as_deref(), Some("PENDING"));

        let dedicated = f.store.dedicated();
        let envelope = f
            .broker
            .dequeue(dedicated.as_ref(), &pq("c-1"), QueueType::Fifo, SHORT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.store.llen(&pending).await.unwrap(), 0);
        assert_eq!(f.store.lrange(&processing, 0, -1).await.unwrap(), vec![id.to_string()]);
        assert_eq!(envelope.state.status, MessageStatus::Processing);

        f.broker.acknowledge(&pq("c-1"), &envelope).await.unwrap();
        assert_eq!(f.store.llen(&processing).await.unwrap(), 0);
        assert!(status(&f.store, &orders(), &id).await.is_none());
        let archived = f.store.lrange(&orders().acknowledged(), 0, -1).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert!(archived[0].contains("ACKNOWLEDGED"));
    }

    #[tokio::test]
    async fn test_retry_requeues_then_dead_letters() {
        let f = fixture();
        let params = QueueParams::default().with_defaults(crate::message::DeliveryOverrides {
            retry_threshold: Some(2),
            retry_delay_ms: Some(0),
            ..Default::default()
        });
        f.queues.create(&orders(), params).await.unwrap();
        let id = f.broker.publish("orders", Message::new(json!({}))).await.unwrap()[0];
        let dedicated = f.store.dedicated();

        let first = f
            .broker
            .dequeue(dedicated.as_ref(), &pq("c-1"), QueueType::Fifo, SHORT)
            .await
            .unwrap()
            .unwrap();
        let action = f
            .broker
            .retry(&pq("c-1"), &first, RetryCause::HandlerError)
            .await
            .unwrap();
        assert_eq!(action, RetryAction::Requeue);
        assert_eq!(status(&f.store, &orders(), &id).await.as_deref(), Some("PENDING"));

        let second = f
            .broker
            .dequeue(dedicated.as_ref(), &pq("c-1"), QueueType::Fifo, SHORT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.state.attempts, 1);
        let action = f
            .broker
            .retry(&pq("c-1"), &second, RetryCause::HandlerError)
            .await
            .unwrap();
        assert_eq!(
            action,
            RetryAction::DeadLetter(DeadLetterCause::RetryThresholdExceeded)
        );
        assert_eq!(f.store.llen(&orders().dead_lettered()).await.unwrap(), 1);
        assert_eq!(f.store.llen(&pq("c-1").key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_with_delay_parks_message() {
        let f = fixture();
        f.queues.create(&orders(), QueueParams::default()).await.unwrap();
        let id = f
            .broker
            .publish("orders", Message::new(json!({})).with_retry_delay(Duration::from_secs(5)))
            .await
            .unwrap()[0];
        let dedicated = f.store.dedicated();
        let envelope = f
            .broker
            .dequeue(dedicated.as_ref(), &pq("c-1"), QueueType::Fifo, SHORT)
            .await
            .unwrap()
            .unwrap();

        let action = f
            .broker
            .retry(&pq("c-1"), &envelope, RetryCause::ConsumeTimeout)
            .await
            .unwrap();
        assert_eq!(action, RetryAction::Delay { delay_ms: 5_000 });
        assert_eq!(status(&f.store, &orders(), &id).await.as_deref(), Some("DELAYED"));
        assert_eq!(f.store.zcard(&orders().delayed()).await.unwrap(), 1);

        let stored = f.broker.load(&orders(), &id).await.unwrap().unwrap();
        assert_eq!(stored.state.attempts, 1);
        assert_eq!(stored.state.last_retry_cause, Some(RetryCause::ConsumeTimeout));
    }

    #[tokio::test]
    async fn test_retry_of_message_not_in_processing_fails() {
        let f = fixture();
        f.queues.create(&orders(), QueueParams::default()).await.unwrap();
        let id = f
            .broker
            .publish("orders", Message::new(json!({})).with_retry_delay(Duration::ZERO))
            .await
            .unwrap()[0];
        let envelope = f.broker.load(&orders(), &id).await.unwrap().unwrap();

        let err = f
            .broker
            .retry(&pq("c-1"), &envelope, RetryCause::HandlerError)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Requeue(ref r) if r == reason::MESSAGE_NOT_PROCESSING));
    }

    #[tokio::test]
    async fn test_pub_sub_fans_out_per_group() {
        let f = fixture();
        let events = QueueName::new("shop", "events").unwrap();
        f.queues
            .create(&events, QueueParams::default().with_delivery(DeliveryModel::PubSub))
            .await
            .unwrap();

        let err = f.broker.publish("events", Message::new(json!({}))).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotPublished(ref r) if r == NO_CONSUMER_GROUPS));

        f.queues.save_consumer_group(&events, "audit").await.unwrap();
        f.queues.save_consumer_group(&events, "billing").await.unwrap();
        let ids = f.broker.publish("events", Message::new(json!({}))).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(f.store.llen(&events.pending(Some("audit"))).await.unwrap(), 1);
        assert_eq!(f.store.llen(&events.pending(Some("billing"))).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_publish_is_not_pending() {
        let f = fixture();
        f.queues.create(&orders(), QueueParams::default()).await.unwrap();
        let mut published = f.broker.subscribe_events();

        let id = f
            .broker
            .publish(
                "orders",
                Message::new(json!({})).with_schedule_delay(Duration::from_secs(2)),
            )
            .await
            .unwrap()[0];

        assert_eq!(f.store.llen(&orders().pending(None)).await.unwrap(), 0);
        assert_eq!(f.store.zcard(&orders().scheduled()).await.unwrap(), 1);
        assert_eq!(status(&f.store, &orders(), &id).await.as_deref(), Some("SCHEDULED"));
        assert!(matches!(
            published.try_recv(),
            Ok(BrokerEvent::Scheduled { id: got, .. }) if got == id
        ));
    }

    #[tokio::test]
    async fn test_release_unprocessed_keeps_attempts() {
        let f = fixture();
        f.queues.create(&orders(), QueueParams::default()).await.unwrap();
        let id = f.broker.publish("orders", Message::new(json!({}))).await.unwrap()[0];
        let dedicated = f.store.dedicated();
        f.broker.register_processing_queue(&pq("c-1")).await.unwrap();
        f.broker
            .dequeue(dedicated.as_ref(), &pq("c-1"), QueueType::Fifo, SHORT)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.broker.release_unprocessed(&pq("c-1")).await.unwrap(), 1);
        f.broker.unregister_processing_queue(&pq("c-1")).await.unwrap();

        let stored = f.broker.load(&orders(), &id).await.unwrap().unwrap();
        assert_eq!(stored.state.attempts, 0);
        assert_eq!(stored.state.status, MessageStatus::Pending);
        assert!(f.store.hgetall(&KeySchema::processing_queues()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_window() {
        let f = fixture();
        let limit = RateLimit {
            limit: 2,
            interval_ms: 60_000,
        };
        assert!(!f.broker.rate_limit_exceeded(&orders(), &limit).await.unwrap());
        assert!(!f.broker.rate_limit_exceeded(&orders(), &limit).await.unwrap());
        assert!(f.broker.rate_limit_exceeded(&orders(), &limit).await.unwrap());
    }

    #[tokio::test]
    async fn test_archive_is_bounded() {
        let f = fixture();
        f.queues.create(&orders(), QueueParams::default()).await.unwrap();
        let store: Arc<dyn Store> = Arc::new(f.store.clone());
        let config = BrokerConfig {
            dead_lettered: ArchiveConfig {
                enabled: true,
                queue_size: 2,
                expire_ms: 60_000,
            },
            ..BrokerConfig::default()
        };
        let broker = Broker::new(store, KeySchema::new("shop").unwrap(), config);
        let dedicated = f.store.dedicated();

        for n in 0..3 {
            broker
                .publish("orders", Message::new(json!(n)).with_retry_threshold(0))
                .await
                .unwrap();
            let envelope = broker
                .dequeue(dedicated.as_ref(), &pq("c-1"), QueueType::Fifo, SHORT)
                .await
                .unwrap()
                .unwrap();
            broker
                .retry(&pq("c-1"), &envelope, RetryCause::HandlerError)
                .await
                .unwrap();
        }

        let archived = f.store.lrange(&orders().dead_lettered(), 0, -1).await.unwrap();
        assert_eq!(archived.len(), 2);
        let newest: MessageEnvelope = serde_json::from_str(&archived[0]).unwrap();
        assert_eq!(newest.message.body, json!(2));
    }

    #[tokio::test]
    async fn test_disabled_archive_only_deletes() {
        let f = fixture();
        f.queues.create(&orders(), QueueParams::default()).await.unwrap();
        let store: Arc<dyn Store> = Arc::new(f.store.clone());
        let broker = Broker::new(store, KeySchema::new("shop").unwrap(), BrokerConfig::default());
        let id = broker.publish("orders", Message::new(json!({}))).await.unwrap()[0];
        let dedicated = f.store.dedicated();
        let envelope = broker
            .dequeue(dedicated.as_ref(), &pq("c-1"), QueueType::Fifo, SHORT)
            .await
            .unwrap()
            .unwrap();

        broker.acknowledge(&pq("c-1"), &envelope).await.unwrap();
        assert!(broker.load(&orders(), &id).await.unwrap().is_none());
        assert!(!f.store.exists(&orders().acknowledged()).await.unwrap());
    }

    #[tokio::test]
    async fn test_settling_a_message_taken_elsewhere_fails() {
        let f = fixture();
        f.queues.create(&orders(), QueueParams::default()).await.unwrap();
        let id = f
            .broker
            .publish("orders", Message::new(json!({})).with_retry_delay(Duration::ZERO))
            .await
            .unwrap()[0];
        let dedicated = f.store.dedicated();
        let envelope = f
            .broker
            .dequeue(dedicated.as_ref(), &pq("c-1"), QueueType::Fifo, SHORT)
            .await
            .unwrap()
            .unwrap();

        // Recovered on behalf of a presumed dead owner.
        f.broker
            .retry(&pq("c-1"), &envelope, RetryCause::OfflineConsumer)
            .await
            .unwrap();

        let err = f.broker.acknowledge(&pq("c-1"), &envelope).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotSettled(ref r) if r == reason::MESSAGE_NOT_PROCESSING));
        let err = f
            .broker
            .dead_letter(&pq("c-1"), envelope, DeadLetterCause::RetryThresholdExceeded)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotSettled(_)));

        assert_eq!(
            f.store.lrange(&orders().pending(None), 0, -1).await.unwrap(),
            vec![id.to_string()]
        );
        let stored = f.broker.load(&orders(), &id).await.unwrap().unwrap();
        assert_eq!(stored.state.status, MessageStatus::Pending);
        assert_eq!(f.store.llen(&orders().acknowledged()).await.unwrap(), 0);
        assert_eq!(f.store.llen(&orders().dead_lettered()).await.unwrap(), 0);
    }
}
