//! The consumer process.
//!
//! A [`Consumer`] runs, under one [`Supervisor`]:
//!
//! - a garbage collector and a scheduler (each optional; only one instance
//!   deployment-wide does work at a time),
//! - one worker per subscribed queue.
//!
//! Its heartbeat runs beside the supervisor and is removed only after every
//! worker has returned.
//!
//! A worker moves messages from pending into its own processing queue, runs
//! the handler on a separate task and races it against the consume timeout.
//! On shutdown it returns unhandled messages to pending and removes its
//! processing queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError};
use crate::config::{GcConfig, RedqConfig, SchedulerConfig};
use crate::error::Error;
use crate::gc::GarbageCollector;
use crate::handler::{HandlerError, MessageHandler};
use crate::heartbeat::ConsumerHeartbeat;
use crate::keys::{validate_name, ProcessingQueue, QueueName};
use crate::message::{now_ms, MessageEnvelope, RetryCause};
use crate::notify::{Notifier, SystemEvent};
use crate::queue::{QueueError, QueueManager, QueueParams};
use crate::scheduler::Scheduler;
use crate::supervisor::{ShutdownListener, ShutdownSignal, Supervisor};

/// Longest a worker blocks on an empty list queue before looking at the
/// shutdown signal again.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a rate limit hit or a failed dequeue.
const BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub heartbeat_interval: Duration,
    pub gc: GcConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self::from(&RedqConfig::default())
    }
}

impl From<&RedqConfig> for ConsumerOptions {
    fn from(config: &RedqConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.consumer.heartbeat_interval_ms),
            gc: config.gc.clone(),
            scheduler: config.scheduler.clone(),
        }
    }
}

struct Subscription {
    queue: QueueName,
    group: Option<String>,
    handler: Arc<dyn MessageHandler>,
}

pub struct Consumer {
    id: String,
    broker: Broker,
    options: ConsumerOptions,
    subscriptions: Vec<Subscription>,
}

impl Consumer {
    pub fn new(broker: Broker, options: ConsumerOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            broker,
            options,
            subscriptions: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribe `handler` to `queue` (`name` or `name@namespace`). Pub/sub
    /// queues need a consumer group; it is registered when the worker starts.
    /// Each queue and group pair can be consumed once per consumer.
    pub fn consume(
        &mut self,
        queue: &str,
        group: Option<&str>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), Error> {
        let queue = self.broker.keys().queue(queue)?;
        if let Some(group) = group {
            validate_name(group)?;
        }
        if self
            .subscriptions
            .iter()
            .any(|s| s.queue == queue && s.group.as_deref() == group)
        {
            return Err(Error::DuplicateSubscription(queue.to_string()));
        }
        info!(queue = %queue, group = ?group, handler = %handler.name(), "Subscribed");
        self.subscriptions.push(Subscription {
            queue,
            group: group.map(str::to_string),
            handler,
        });
        Ok(())
    }

    /// Run every role until `shutdown` fires, then stop them all.
    #[instrument(skip_all, fields(consumer_id = %self.id))]
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<(), Error> {
        let store = self.broker.store().clone();
        let heartbeat = ConsumerHeartbeat::new(store, &self.id)
            .with_interval(self.options.heartbeat_interval);
        // Alive before the first processing queue exists.
        heartbeat.beat().await?;

        // The heartbeat runs outside the supervisor on its own signal: it has
        // to outlive every worker, or another GC recovers messages whose
        // handlers are still running.
        let pulse = ShutdownSignal::new();
        let beating = tokio::spawn(heartbeat.clone().run(pulse.subscribe()));

        let mut supervisor = Supervisor::new(format!("consumer-{}", self.id), shutdown);

        if self.options.gc.enabled {
            let gc = GarbageCollector::new(self.broker.clone(), &self.id, self.options.gc.clone());
            supervisor.spawn("gc", |listener| async move {
                gc.run(listener).await.map_err(Error::from)
            });
        }
        if self.options.scheduler.enabled {
            let scheduler = Scheduler::new(self.broker.clone(), self.options.scheduler.clone());
            supervisor.spawn("scheduler", |listener| scheduler.run(listener));
        }

        for subscription in self.subscriptions {
            let pq = ProcessingQueue::new(subscription.queue, &self.id, subscription.group);
            let worker = Worker {
                broker: self.broker.clone(),
                pq,
                handler: subscription.handler,
            };
            supervisor.spawn(format!("worker:{}", worker.pq.queue), |listener| {
                worker.run(listener)
            });
        }

        info!(roles = supervisor.roles().len(), "Consumer started");
        let result = supervisor.run().await;

        pulse.trigger();
        match beating.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Heartbeat failed"),
            Err(e) => warn!(error = %e, "Heartbeat task panicked"),
        }
        if let Err(e) = heartbeat.remove().await {
            warn!(error = %e, "Failed to remove heartbeat, the GC reaps it once stale");
        }
        info!("Consumer stopped");
        result
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Delivery {
    Acknowledged,
    Failed(RetryCause),
}

struct Worker {
    broker: Broker,
    pq: ProcessingQueue,
    handler: Arc<dyn MessageHandler>,
}

impl Worker {
    #[instrument(skip_all, fields(queue = %self.pq.queue, group = ?self.pq.group))]
    async fn run(self, mut shutdown: ShutdownListener) -> Result<(), Error> {
        let mut params = self.prepare().await?;
        self.broker.register_processing_queue(&self.pq).await?;

        let stale = Arc::new(AtomicBool::new(false));
        let watcher = self.watch_params(stale.clone()).await;
        let dedicated = self.broker.store().dedicated();
        info!(handler = %self.handler.name(), "Worker started");

        let mut settled: Result<(), Error> = Ok(());
        while !shutdown.is_shutdown() {
            if stale.swap(false, Ordering::SeqCst) {
                match self.broker.queue_params(&self.pq.queue).await {
                    Ok(fresh) => {
                        debug!(rate_limit = ?fresh.rate_limit, "Queue properties refreshed");
                        params = fresh;
                    }
                    Err(e) => warn!(error = %e, "Failed to refresh queue properties"),
                }
            }

            if let Some(limit) = params.rate_limit {
                match self.broker.rate_limit_exceeded(&self.pq.queue, &limit).await {
                    Ok(false) => {}
                    Ok(true) => {
                        debug!("Rate limit exceeded, backing off");
                        pause(&mut shutdown).await;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Rate limit check failed");
                        pause(&mut shutdown).await;
                        continue;
                    }
                }
            }

            // Never cancelled midway: an interrupted blocking move could land
            // a message in a processing queue nobody watches anymore.
            let envelope = match self
                .broker
                .dequeue(
                    dedicated.as_ref(),
                    &self.pq,
                    params.queue_type,
                    Some(DEQUEUE_TIMEOUT),
                )
                .await
            {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Dequeue failed");
                    pause(&mut shutdown).await;
                    continue;
                }
            };

            // A processing queue holds one message at a time, so an unsettled
            // message stops the worker instead of sitting next to the next one.
            if let Err(e) = self.process(envelope).await {
                error!(error = %e, "Failed to settle message, stopping worker");
                settled = Err(e.into());
                break;
            }
        }

        if let Some(watcher) = watcher {
            watcher.abort();
        }
        let released = self.release().await;
        match (settled, released) {
            (Err(e), Err(cleanup)) => {
                warn!(error = %cleanup, "Processing queue left for the GC");
                Err(e)
            }
            (settled, released) => settled.and(released),
        }
    }

    /// Hand back whatever `pq` still holds and drop it. On failure `pq`
    /// stays registered, so the GC recovers it once this consumer is gone.
    async fn release(&self) -> Result<(), Error> {
        self.broker.release_unprocessed(&self.pq).await?;
        self.broker.unregister_processing_queue(&self.pq).await?;
        info!("Worker stopped");
        Ok(())
    }

    /// Check the subscription against the queue's delivery model.
    async fn prepare(&self) -> Result<QueueParams, Error> {
        let queue = &self.pq.queue;
        let params = self.broker.queue_params(queue).await?;
        match (&self.pq.group, params.is_pub_sub()) {
            (Some(group), true) => {
                QueueManager::new(self.broker.store().clone())
                    .save_consumer_group(queue, group)
                    .await?;
            }
            (None, true) => return Err(QueueError::ConsumerGroupRequired(queue.clone()).into()),
            (Some(_), false) => return Err(QueueError::NotPubSub(queue.clone()).into()),
            (None, false) => {}
        }
        Ok(params)
    }

    /// Flag `stale` whenever this queue's properties change elsewhere.
    async fn watch_params(&self, stale: Arc<AtomicBool>) -> Option<tokio::task::JoinHandle<()>> {
        let notifier = Notifier::new(self.broker.store().clone());
        let mut events = match notifier.subscribe().await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Cannot watch queue updates, properties stay cached");
                return None;
            }
        };
        let queue = self.pq.queue.clone();
        Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if matches!(&event, SystemEvent::QueueUpdated { .. }) && event.queue() == &queue {
                    stale.store(true, Ordering::SeqCst);
                }
            }
        }))
    }

    async fn process(&self, envelope: MessageEnvelope) -> Result<Delivery, BrokerError> {
        let message_id = envelope.id;
        if envelope.has_expired(now_ms()) {
            info!(message_id = %message_id, "Message expired before handling");
            self.broker
                .retry(&self.pq, &envelope, RetryCause::TtlExpired)
                .await?;
            return Ok(Delivery::Failed(RetryCause::TtlExpired));
        }

        let delivery = self.handle(&envelope).await;
        match delivery {
            Delivery::Acknowledged => self.broker.acknowledge(&self.pq, &envelope).await?,
            Delivery::Failed(cause) => {
                self.broker.retry(&self.pq, &envelope, cause).await?;
            }
        }
        Ok(delivery)
    }

    /// Run the handler on its own task, bounded by the consume timeout. A
    /// handler that times out keeps running detached; its result is ignored.
    async fn handle(&self, envelope: &MessageEnvelope) -> Delivery {
        let handler = self.handler.clone();
        let message = envelope.clone();
        let task = tokio::spawn(async move { handler.handle(&message).await });

        let timeout_ms = envelope.settings.consume_timeout_ms;
        let joined = if timeout_ms > 0 {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        message_id = %envelope.id,
                        timeout_ms = timeout_ms,
                        "Handler timed out"
                    );
                    return Delivery::Failed(RetryCause::ConsumeTimeout);
                }
            }
        } else {
            task.await
        };

        match joined {
            Ok(Ok(())) => Delivery::Acknowledged,
            Ok(Err(e)) => {
                log_handler_error(envelope, &e);
                Delivery::Failed(RetryCause::HandlerError)
            }
            Err(e) => {
                error!(message_id = %envelope.id, error = %e, "Handler panicked");
                Delivery::Failed(RetryCause::HandlerError)
            }
        }
    }
}

fn log_handler_error(envelope: &MessageEnvelope, e: &HandlerError) {
    warn!(
        message_id = %envelope.id,
        attempts = envelope.state.attempts,
        error = %e,
        "Handler failed"
    );
}

async fn pause(shutdown: &mut ShutdownListener) {
    tokio::select! {
        _ = shutdown.recv() => {}
        _ = tokio::time::sleep(BACKOFF) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::handler::LogHandler;
    use crate::heartbeat;
    use crate::keys::KeySchema;
    use crate::message::{DeliverySettings, Message, MessageStatus};
    use crate::queue::{DeliveryModel, QueueType};
    use crate::store::{MemoryStore, Store};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Recording {
        calls: AtomicUsize,
        fail: bool,
        stall: Option<Duration>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: false,
                stall: None,
            })
        }
    }

    #[async_trait]
    impl MessageHandler for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn handle(&self, _message: &MessageEnvelope) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            if self.fail {
                return Err(HandlerError::failed("boom"));
            }
            Ok(())
        }
    }

    fn setup() -> (MemoryStore, Broker) {
        let store = MemoryStore::new();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let broker = Broker::new(shared, KeySchema::new("shop").unwrap(), BrokerConfig::default());
        (store, broker)
    }

    fn orders() -> QueueName {
        QueueName::new("shop", "orders").unwrap()
    }

    fn worker(broker: &Broker, handler: Arc<dyn MessageHandler>) -> Worker {
        Worker {
            broker: broker.clone(),
            pq: ProcessingQueue::new(orders(), "c-1", None),
            handler,
        }
    }

    async fn dequeue_one(store: &MemoryStore, worker: &Worker) -> MessageEnvelope {
        let dedicated = store.dedicated();
        worker
            .broker
            .dequeue(dedicated.as_ref(), &worker.pq, QueueType::Fifo, Some(DEQUEUE_TIMEOUT))
            .await
            .unwrap()
            .unwrap()
    }

    async fn create_orders(broker: &Broker, params: QueueParams) {
        QueueManager::new(broker.store().clone())
            .create(&orders(), params)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_successful_delivery_is_acknowledged() {
        let (store, broker) = setup();
        create_orders(&broker, QueueParams::default()).await;
        broker.publish("orders", Message::new(json!({}))).await.unwrap();

        let handler = Recording::new();
        let worker = worker(&broker, handler.clone());
        let envelope = dequeue_one(&store, &worker).await;
        assert_eq!(worker.process(envelope).await.unwrap(), Delivery::Acknowledged);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.llen(&worker.pq.key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_message_skips_handler() {
        let (store, broker) = setup();
        create_orders(&broker, QueueParams::default()).await;
        let id = broker
            .publish("orders", Message::new(json!({})).with_ttl(Duration::from_millis(1)))
            .await
            .unwrap()[0];
        tokio::time::sleep(Duration::from_millis(5)).await;

        let handler = Recording::new();
        let worker = worker(&broker, handler.clone());
        let envelope = dequeue_one(&store, &worker).await;
        assert_eq!(
            worker.process(envelope).await.unwrap(),
            Delivery::Failed(RetryCause::TtlExpired)
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(broker.load(&orders(), &id).await.unwrap().is_none());
        assert_eq!(store.llen(&orders().dead_lettered()).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_timeout_retries_message() {
        let (store, broker) = setup();
        create_orders(&broker, QueueParams::default()).await;
        let id = broker
            .publish(
                "orders",
                Message::new(json!({}))
                    .with_consume_timeout(Duration::from_millis(100))
                    .with_retry_delay(Duration::ZERO),
            )
            .await
            .unwrap()[0];

        let handler = Arc::new(Recording {
            calls: AtomicUsize::new(0),
            fail: false,
            stall: Some(Duration::from_secs(60)),
        });
        let worker = worker(&broker, handler);
        let envelope = dequeue_one(&store, &worker).await;
        assert_eq!(
            worker.process(envelope).await.unwrap(),
            Delivery::Failed(RetryCause::ConsumeTimeout)
        );

        let stored = broker.load(&orders(), &id).await.unwrap().unwrap();
        assert_eq!(stored.state.status, MessageStatus::Pending);
        assert_eq!(stored.state.attempts, 1);
        assert_eq!(stored.state.last_retry_cause, Some(RetryCause::ConsumeTimeout));
    }

    #[tokio::test]
    async fn test_failed_handler_retries() {
        let (store, broker) = setup();
        create_orders(
            &broker,
            QueueParams::default().with_defaults(crate::message::DeliveryOverrides {
                retry_delay_ms: Some(0),
                ..Default::default()
            }),
        )
        .await;
        broker.publish("orders", Message::new(json!({}))).await.unwrap();

        let handler = Arc::new(Recording {
            calls: AtomicUsize::new(0),
            fail: true,
            stall: None,
        });
        let worker = worker(&broker, handler);
        let envelope = dequeue_one(&store, &worker).await;
        assert_eq!(
            worker.process(envelope).await.unwrap(),
            Delivery::Failed(RetryCause::HandlerError)
        );
        assert_eq!(store.llen(&orders().pending(None)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pub_sub_subscription_needs_group() {
        let (_, broker) = setup();
        create_orders(&broker, QueueParams::default().with_delivery(DeliveryModel::PubSub)).await;

        let err = worker(&broker, Recording::new()).prepare().await.unwrap_err();
        assert!(matches!(err, Error::Queue(QueueError::ConsumerGroupRequired(_))));

        let mut grouped = worker(&broker, Recording::new());
        grouped.pq = ProcessingQueue::new(orders(), "c-1", Some("billing".to_string()));
        grouped.prepare().await.unwrap();
        let groups = QueueManager::new(broker.store().clone())
            .consumer_groups(&orders())
            .await
            .unwrap();
        assert_eq!(groups, vec!["billing".to_string()]);
    }

    #[tokio::test]
    async fn test_consumer_runs_and_cleans_up() {
        let (store, broker) = setup();
        create_orders(&broker, QueueParams::default()).await;
        let message_id = broker.publish("orders", Message::new(json!(1))).await.unwrap()[0];

        let handler = Recording::new();
        let mut consumer = Consumer::new(broker.clone(), ConsumerOptions::default());
        consumer.consume("orders", None, handler.clone()).unwrap();
        assert!(matches!(
            consumer.consume("orders@shop", None, Arc::new(LogHandler::new())),
            Err(Error::DuplicateSubscription(_))
        ));
        let id = consumer.id().to_string();

        let shutdown = ShutdownSignal::with_timeout(Duration::from_secs(10));
        let running = tokio::spawn(consumer.run(shutdown.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while broker.load(&orders(), &message_id).await.unwrap().is_some() {
            assert!(tokio::time::Instant::now() < deadline, "message never acknowledged");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(heartbeat::is_alive(&store, &id).await.unwrap());

        shutdown.trigger();
        running.await.unwrap().unwrap();
        assert!(!heartbeat::is_alive(&store, &id).await.unwrap());
        assert!(store
            .hgetall(&KeySchema::processing_queues())
            .await
            .unwrap()
            .is_empty());
    }

    /// Fails its first message after deleting the queue under it, so the
    /// failure cannot be settled. Stalls on anything after that.
    struct DeletesQueue {
        store: Arc<dyn Store>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for DeletesQueue {
        fn name(&self) -> &str {
            "deletes-queue"
        }

        async fn handle(&self, _message: &MessageEnvelope) -> Result<(), HandlerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_secs(60)).await;
                return Ok(());
            }
            let mut tx = crate::store::Transaction::new();
            tx.del(orders().properties());
            self.store.commit(tx).await.map_err(|e| HandlerError::failed(e.to_string()))?;
            Err(HandlerError::failed("queue is gone"))
        }
    }

    #[tokio::test]
    async fn test_unsettled_message_stops_worker() {
        let (store, broker) = setup();
        create_orders(&broker, QueueParams::default()).await;
        for n in 0..2 {
            broker.publish("orders", Message::new(json!(n))).await.unwrap();
        }

        let handler = Arc::new(DeletesQueue {
            store: broker.store().clone(),
            calls: AtomicUsize::new(0),
        });
        let mut consumer = Consumer::new(broker.clone(), ConsumerOptions::default());
        consumer.consume("orders", None, handler.clone()).unwrap();
        let id = consumer.id().to_string();

        let shutdown = ShutdownSignal::with_timeout(Duration::from_secs(10));
        let result = tokio::time::timeout(Duration::from_secs(5), consumer.run(shutdown))
            .await
            .expect("consumer should stop on its own");
        assert!(matches!(
            result,
            Err(Error::Broker(BrokerError::Requeue(ref r))) if r == "QUEUE_NOT_FOUND"
        ));

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let pq = ProcessingQueue::new(orders(), &id, None);
        assert_eq!(store.llen(&pq.key()).await.unwrap(), 1);
        assert_eq!(store.llen(&orders().pending(None)).await.unwrap(), 1);
        // Left registered for the GC, and the owner no longer looks alive.
        assert!(store
            .hgetall(&KeySchema::processing_queues())
            .await
            .unwrap()
            .contains_key(&pq.key()));
        assert!(!heartbeat::is_alive(&store, &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_outlives_running_handler() {
        let (store, broker) = setup();
        create_orders(&broker, QueueParams::default()).await;
        let message_id = broker.publish("orders", Message::new(json!({}))).await.unwrap()[0];

        let handler = Arc::new(Recording {
            calls: AtomicUsize::new(0),
            fail: false,
            stall: Some(Duration::from_millis(500)),
        });
        let mut consumer = Consumer::new(broker.clone(), ConsumerOptions::default());
        consumer.consume("orders", None, handler.clone()).unwrap();
        let id = consumer.id().to_string();

        let shutdown = ShutdownSignal::with_timeout(Duration::from_secs(10));
        let running = tokio::spawn(consumer.run(shutdown.clone()));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handler.calls.load(Ordering::SeqCst) == 0 {
            assert!(tokio::time::Instant::now() < deadline, "handler never called");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.trigger();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(heartbeat::is_alive(&store, &id).await.unwrap());
        let pq = ProcessingQueue::new(orders(), &id, None);
        assert_eq!(store.llen(&pq.key()).await.unwrap(), 1);

        running.await.unwrap().unwrap();
        assert!(broker.load(&orders(), &message_id).await.unwrap().is_none());
        assert_eq!(store.llen(&orders().pending(None)).await.unwrap(), 0);
        assert!(!heartbeat::is_alive(&store, &id).await.unwrap());
    }

    #[test]
    fn test_options_follow_config() {
        let mut config = RedqConfig::default();
        config.consumer.heartbeat_interval_ms = 250;
        config.gc.enabled = false;
        let options = ConsumerOptions::from(&config);
        assert_eq!(options.heartbeat_interval, Duration::from_millis(250));
        assert!(!options.gc.enabled);
        assert!(options.scheduler.enabled);
    }

    #[test]
    fn test_default_settings_disable_timeout() {
        assert_eq!(DeliverySettings::default().consume_timeout_ms, 0);
    }
}
