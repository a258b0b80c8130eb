//! Recovery of messages held by dead consumers.
//!
//! One collector in the whole deployment works at a time, guarded by a lock
//! it keeps extending across ticks. Each tick walks the global processing
//! queue index; processing queues whose owner has no fresh heartbeat get
//! their messages retried with cause `OFFLINE_CONSUMER` and are then
//! removed. Stale heartbeat records are reaped at the end of the tick.

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError};
use crate::config::GcConfig;
use crate::heartbeat;
use crate::keys::{KeySchema, ProcessingQueue};
use crate::lock::{LockError, LockManager};
use crate::message::{now_ms, RetryAction, RetryCause};
use crate::store::{StoreError, Transaction};
use crate::supervisor::ShutdownListener;

/// GC errors
#[derive(Debug, Error)]
pub enum GcError {
    /// The processing queue index holds a key that does not parse. Nothing
    /// else writes that index, so this means the keyspace is corrupt.
    #[error("corrupt processing queue key '{0}'")]
    CorruptProcessingQueueKey(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl GcError {
    /// Errors that must stop the collector instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GcError::CorruptProcessingQueueKey(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcStats {
    pub processing_queues: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub heartbeats_reaped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    /// Another consumer is collecting.
    Skipped,
    Collected(GcStats),
}

pub struct GarbageCollector {
    broker: Broker,
    consumer_id: String,
    lock: LockManager,
    config: GcConfig,
}

impl GarbageCollector {
    /// `consumer_id` is the consumer running this collector; its own
    /// processing queues are never touched.
    pub fn new(broker: Broker, consumer_id: impl Into<String>, config: GcConfig) -> Self {
        let lock = LockManager::new(broker.store().clone());
        Self {
            broker,
            consumer_id: consumer_id.into(),
            lock,
            config,
        }
    }

    pub fn lock_key() -> String {
        KeySchema::lock("gc")
    }

    pub async fn tick(&self) -> Result<GcOutcome, GcError> {
        self.tick_at(now_ms()).await
    }

    /// Run one collection judging liveness at `now`.
    pub async fn tick_at(&self, now: i64) -> Result<GcOutcome, GcError> {
        let ttl = Duration::from_millis(self.config.lock_ttl_ms);
        match self.lock.acquire_lock(&Self::lock_key(), ttl, false).await {
            Ok(()) => {}
            Err(LockError::AcquireError(_) | LockError::ExtendError(_)) => {
                debug!("GC lock held elsewhere, skipping tick");
                return Ok(GcOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        }

        match self.collect(now).await {
            Err(e) if e.is_fatal() => {
                self.lock.release_lock().await?;
                Err(e)
            }
            other => other.map(GcOutcome::Collected),
        }
    }

    async fn collect(&self, now: i64) -> Result<GcStats, GcError> {
        let store = self.broker.store();
        let mut stats = GcStats::default();

        for (key, owner) in store.hgetall(&KeySchema::processing_queues()).await? {
            let pq = ProcessingQueue::parse(&key)
                .map_err(|_| GcError::CorruptProcessingQueueKey(key.clone()))?;
            if owner == self.consumer_id || pq.consumer_id == self.consumer_id {
                continue;
            }
            if heartbeat::is_alive_at(store.as_ref(), &pq.consumer_id, now).await? {
                continue;
            }
            info!(processing_queue = %key, consumer_id = %pq.consumer_id, "Collecting dead consumer");
            self.recover(&pq, &mut stats).await?;
            self.broker.unregister_processing_queue(&pq).await?;
            stats.processing_queues += 1;
        }

        stats.heartbeats_reaped = heartbeat::reap_expired(store.as_ref(), now).await?;
        if stats != GcStats::default() {
            info!(
                processing_queues = stats.processing_queues,
                retried = stats.retried,
                dead_lettered = stats.dead_lettered,
                heartbeats_reaped = stats.heartbeats_reaped,
                "GC tick"
            );
        }
        Ok(stats)
    }

    async fn recover(&self, pq: &ProcessingQueue, stats: &mut GcStats) -> Result<(), GcError> {
        let store = self.broker.store();
        for id in store.lrange(&pq.key(), 0, -1).await? {
            let envelope = match Uuid::parse_str(&id) {
                Ok(uuid) => match self.broker.load(&pq.queue, &uuid).await {
                    Ok(envelope) => envelope,
                    Err(BrokerError::Store(StoreError::SerializationError(e))) => {
                        warn!(message_id = %id, error = %e, "Dropping unreadable message");
                        None
                    }
                    Err(e) => return Err(e.into()),
                },
                Err(_) => None,
            };
            let Some(envelope) = envelope else {
                let mut tx = Transaction::new();
                tx.lrem(pq.key(), &id);
                if let Ok(uuid) = Uuid::parse_str(&id) {
                    tx.del(pq.queue.message(&uuid));
                }
                store.commit(tx).await?;
                continue;
            };

            match self.broker.retry(pq, &envelope, RetryCause::OfflineConsumer).await? {
                RetryAction::DeadLetter(_) => stats.dead_lettered += 1,
                RetryAction::Delay { .. } | RetryAction::Requeue => stats.retried += 1,
            }
        }
        Ok(())
    }

    /// Collect every interval until shutdown or a fatal error.
    #[instrument(skip_all, name = "gc", fields(consumer_id = %self.consumer_id))]
    pub async fn run(self, mut shutdown: ShutdownListener) -> Result<(), GcError> {
        info!(interval_ms = self.config.interval_ms, "Garbage collector started");
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = shutdown.recv() => break Ok(()),
                _ = ticker.tick() => match self.tick().await {
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "Garbage collector stopped");
                        break Err(e);
                    }
                    Err(e) => warn!(error = %e, "GC tick failed"),
                },
            }
        };

        self.lock.release_lock().await?;
        info!("Garbage collector stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::heartbeat::{ConsumerHeartbeat, LIVENESS_WINDOW_MS};
    use crate::keys::QueueName;
    use crate::message::Message;
    use crate::queue::{QueueManager, QueueParams, QueueType};
    use crate::store::{MemoryStore, Store};
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        store: MemoryStore,
        broker: Broker,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let broker = Broker::new(
            shared.clone(),
            KeySchema::new("shop").unwrap(),
            BrokerConfig::default(),
        );
        QueueManager::new(shared)
            .create(&orders(), QueueParams::default())
            .await
            .unwrap();
        Fixture { store, broker }
    }

    fn orders() -> QueueName {
        QueueName::new("shop", "orders").unwrap()
    }

    /// Publish one message and move it into `consumer`'s processing queue.
    async fn hold_message(f: &Fixture, consumer: &str) -> (ProcessingQueue, Uuid) {
        let id = f
            .broker
            .publish(
                "orders",
                Message::new(json!({})).with_retry_delay(Duration::ZERO),
            )
            .await
            .unwrap()[0];
        let pq = ProcessingQueue::new(orders(), consumer, None);
        f.broker.register_processing_queue(&pq).await.unwrap();
        let dedicated = f.store.dedicated();
        f.broker
            .dequeue(
                dedicated.as_ref(),
                &pq,
                QueueType::Fifo,
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap()
            .unwrap();
        (pq, id)
    }

    #[tokio::test]
    async fn test_dead_consumer_messages_are_requeued() {
        let f = fixture().await;
        let (pq, id) = hold_message(&f, "dead").await;

        let gc = GarbageCollector::new(f.broker.clone(), "me", GcConfig::default());
        let GcOutcome::Collected(stats) = gc.tick().await.unwrap() else {
            panic!("gc skipped");
        };
        assert_eq!(stats.processing_queues, 1);
        assert_eq!(stats.retried, 1);

        assert!(!f.store.exists(&pq.key()).await.unwrap());
        assert!(f.store.hgetall(&KeySchema::processing_queues()).await.unwrap().is_empty());
        assert_eq!(
            f.store.lrange(&orders().pending(None), 0, -1).await.unwrap(),
            vec![id.to_string()]
        );
        let envelope = f.broker.load(&orders(), &id).await.unwrap().unwrap();
        assert_eq!(envelope.state.attempts, 1);
        assert_eq!(envelope.state.last_retry_cause, Some(RetryCause::OfflineConsumer));
    }

    #[tokio::test]
    async fn test_live_and_own_queues_are_left_alone() {
        let f = fixture().await;
        let (alive_pq, _) = hold_message(&f, "alive").await;
        let (own_pq, _) = hold_message(&f, "me").await;
        ConsumerHeartbeat::new(f.broker.store().clone(), "alive")
            .beat()
            .await
            .unwrap();

        let gc = GarbageCollector::new(f.broker.clone(), "me", GcConfig::default());
        let GcOutcome::Collected(stats) = gc.tick().await.unwrap() else {
            panic!("gc skipped");
        };
        assert_eq!(stats.processing_queues, 0);
        assert_eq!(f.store.llen(&alive_pq.key()).await.unwrap(), 1);
        assert_eq!(f.store.llen(&own_pq.key()).await.unwrap(), 1);

        // The same consumer, judged after its liveness window.
        let later = now_ms() + LIVENESS_WINDOW_MS + 1_000;
        let GcOutcome::Collected(stats) = gc.tick_at(later).await.unwrap() else {
            panic!("gc skipped");
        };
        assert_eq!(stats.processing_queues, 1);
        assert_eq!(stats.heartbeats_reaped, 1);
        assert_eq!(f.store.llen(&own_pq.key()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_second_collector_skips() {
        let f = fixture().await;
        let first = GarbageCollector::new(f.broker.clone(), "a", GcConfig::default());
        let second = GarbageCollector::new(f.broker.clone(), "b", GcConfig::default());

        assert!(matches!(first.tick().await.unwrap(), GcOutcome::Collected(_)));
        assert_eq!(second.tick().await.unwrap(), GcOutcome::Skipped);
        // The holder keeps its lock across ticks.
        assert!(matches!(first.tick().await.unwrap(), GcOutcome::Collected(_)));
    }

    #[tokio::test]
    async fn test_corrupt_index_is_fatal() {
        let f = fixture().await;
        let mut tx = Transaction::new();
        tx.hset(KeySchema::processing_queues(), "garbage", "x");
        f.store.commit(tx).await.unwrap();

        let gc = GarbageCollector::new(f.broker.clone(), "me", GcConfig::default());
        let err = gc.tick().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!f.store.exists(&GarbageCollector::lock_key()).await.unwrap());
    }
}
