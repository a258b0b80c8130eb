//! Queue properties and the small amount of queue management the delivery
//! engine needs.
//!
//! A queue's properties hash keeps `type` and `delivery` as plain fields so
//! server-side scripts can check them, and the full [`QueueParams`] as JSON
//! under `params`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::heartbeat;
use crate::keys::{validate_name, KeyError, KeySchema, QueueName};
use crate::message::DeliveryOverrides;
use crate::notify::{Notifier, SystemEvent};
use crate::store::{Store, StoreError, Transaction};

/// Queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue {0} already exists")]
    AlreadyExists(QueueName),

    #[error("queue {0} not found")]
    NotFound(QueueName),

    #[error("queue {0} still holds messages")]
    NotEmpty(QueueName),

    #[error("queue {0} has live consumers")]
    HasActiveConsumers(QueueName),

    #[error("queue {0} does not use pub/sub delivery")]
    NotPubSub(QueueName),

    #[error("queue {0} uses pub/sub delivery and needs a consumer group")]
    ConsumerGroupRequired(QueueName),

    #[error("consumer group '{group}' not found on {queue}")]
    ConsumerGroupNotFound { queue: QueueName, group: String },

    #[error("corrupt properties for queue {queue}: {reason}")]
    Corrupt { queue: QueueName, reason: String },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    #[default]
    Fifo,
    Lifo,
    Priority,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Fifo => "fifo",
            QueueType::Lifo => "lifo",
            QueueType::Priority => "priority",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryModel {
    #[default]
    PointToPoint,
    /// Every consumer group receives its own copy of each message.
    PubSub,
}

impl DeliveryModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryModel::PointToPoint => "point_to_point",
            DeliveryModel::PubSub => "pub_sub",
        }
    }
}

/// At most `limit` deliveries per `interval_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub limit: u64,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueParams {
    pub queue_type: QueueType,
    pub delivery: DeliveryModel,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,

    /// Message settings that apply unless a message overrides them.
    #[serde(default)]
    pub defaults: DeliveryOverrides,
}

impl QueueParams {
    pub fn new(queue_type: QueueType) -> Self {
        Self {
            queue_type,
            ..Default::default()
        }
    }

    pub fn with_delivery(mut self, delivery: DeliveryModel) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_rate_limit(mut self, limit: u64, interval_ms: u64) -> Self {
        self.rate_limit = Some(RateLimit { limit, interval_ms });
        self
    }

    pub fn with_defaults(mut self, defaults: DeliveryOverrides) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn is_pub_sub(&self) -> bool {
        self.delivery == DeliveryModel::PubSub
    }

    /// Decode from the properties hash.
    pub fn from_fields(
        queue: &QueueName,
        fields: &HashMap<String, String>,
    ) -> Result<Option<Self>, QueueError> {
        let Some(raw) = fields.get("params") else {
            return Ok(None);
        };
        serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| QueueError::Corrupt {
                queue: queue.clone(),
                reason: e.to_string(),
            })
    }
}

/// Load the params of `queue`.
pub async fn load_params(store: &dyn Store, queue: &QueueName) -> Result<QueueParams, QueueError> {
    let fields = store.hgetall(&queue.properties()).await?;
    QueueParams::from_fields(queue, &fields)?.ok_or_else(|| QueueError::NotFound(queue.clone()))
}

/// Queue management.
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn Store>,
    notifier: Notifier,
}

impl QueueManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let notifier = Notifier::new(store.clone());
        Self { store, notifier }
    }

    pub async fn create(&self, queue: &QueueName, params: QueueParams) -> Result<(), QueueError> {
        if self.exists(queue).await? {
            return Err(QueueError::AlreadyExists(queue.clone()));
        }

        let encoded = serde_json::to_string(&params).map_err(StoreError::from)?;
        let props = queue.properties();
        let mut tx = Transaction::new();
        tx.hset(&props, "type", params.queue_type.as_str())
            .hset(&props, "delivery", params.delivery.as_str())
            .hset(&props, "params", encoded)
            .sadd(KeySchema::queues(), queue.to_string())
            .sadd(KeySchema::namespaces(), &queue.ns);
        self.store.commit(tx).await?;

        info!(queue = %queue, queue_type = %params.queue_type, "Queue created");
        self.notifier
            .notify(SystemEvent::QueueCreated {
                queue: queue.clone(),
            })
            .await;
        Ok(())
    }

    pub async fn exists(&self, queue: &QueueName) -> Result<bool, QueueError> {
        Ok(self.store.exists(&queue.properties()).await?)
    }

    pub async fn get(&self, queue: &QueueName) -> Result<QueueParams, QueueError> {
        load_params(self.store.as_ref(), queue).await
    }

    /// Every queue, across namespaces.
    pub async fn list(&self) -> Result<Vec<QueueName>, QueueError> {
        let mut queues = Vec::new();
        for raw in self.store.smembers(&KeySchema::queues()).await? {
            match raw.parse::<QueueName>() {
                Ok(queue) => queues.push(queue),
                Err(e) => warn!(entry = %raw, error = %e, "Skipping malformed queue index entry"),
            }
        }
        queues.sort_by(|a, b| (&a.ns, &a.name).cmp(&(&b.ns, &b.name)));
        Ok(queues)
    }

    pub async fn set_rate_limit(
        &self,
        queue: &QueueName,
        rate_limit: Option<RateLimit>,
    ) -> Result<(), QueueError> {
        let mut params = self.get(queue).await?;
        params.rate_limit = rate_limit;
        let encoded = serde_json::to_string(&params).map_err(StoreError::from)?;

        let mut tx = Transaction::new();
        tx.hset(queue.properties(), "params", encoded);
        if rate_limit.is_none() {
            tx.del(queue.rate_limit());
        }
        self.store.commit(tx).await?;

        info!(queue = %queue, rate_limit = ?rate_limit, "Queue rate limit updated");
        self.notifier
            .notify(SystemEvent::QueueUpdated {
                queue: queue.clone(),
            })
            .await;
        Ok(())
    }

    pub async fn consumer_groups(&self, queue: &QueueName) -> Result<Vec<String>, QueueError> {
        let mut groups = self.store.smembers(&queue.consumer_groups()).await?;
        groups.sort();
        Ok(groups)
    }

    /// Register a consumer group on a pub/sub queue. Saving an existing
    /// group is a no-op.
    pub async fn save_consumer_group(&self, queue: &QueueName, group: &str) -> Result<(), QueueError> {
        validate_name(group)?;
        if !self.get(queue).await?.is_pub_sub() {
            return Err(QueueError::NotPubSub(queue.clone()));
        }

        let mut tx = Transaction::new();
        tx.sadd(queue.consumer_groups(), group);
        self.store.commit(tx).await?;

        info!(queue = %queue, group = %group, "Consumer group saved");
        self.notifier
            .notify(SystemEvent::ConsumerGroupCreated {
                queue: queue.clone(),
                group: group.to_string(),
            })
            .await;
        Ok(())
    }

    /// Remove a consumer group whose pending messages are all gone.
    pub async fn delete_consumer_group(&self, queue: &QueueName, group: &str) -> Result<(), QueueError> {
        if !self.consumer_groups(queue).await?.iter().any(|g| g == group) {
            return Err(QueueError::ConsumerGroupNotFound {
                queue: queue.clone(),
                group: group.to_string(),
            });
        }
        let pending = self.store.llen(&queue.pending(Some(group))).await?
            + self.store.zcard(&queue.priority_pending(Some(group))).await?;
        if pending > 0 {
            return Err(QueueError::NotEmpty(queue.clone()));
        }

        let mut tx = Transaction::new();
        tx.srem(queue.consumer_groups(), group)
            .del(queue.pending(Some(group)))
            .del(queue.priority_pending(Some(group)));
        self.store.commit(tx).await?;

        info!(queue = %queue, group = %group, "Consumer group deleted");
        self.notifier
            .notify(SystemEvent::ConsumerGroupDeleted {
                queue: queue.clone(),
                group: group.to_string(),
            })
            .await;
        Ok(())
    }

    /// Delete an empty queue nobody is consuming from. Archived messages go
    /// with it.
    pub async fn delete(&self, queue: &QueueName) -> Result<(), QueueError> {
        if !self.exists(queue).await? {
            return Err(QueueError::NotFound(queue.clone()));
        }

        let processing = self.store.hgetall(&queue.processing_queues()).await?;
        for owner in processing.values() {
            if heartbeat::is_alive(self.store.as_ref(), owner).await? {
                return Err(QueueError::HasActiveConsumers(queue.clone()));
            }
        }

        let groups = self.consumer_groups(queue).await?;
        let mut pending = self.store.llen(&queue.pending(None)).await?
            + self.store.zcard(&queue.priority_pending(None)).await?;
        for group in &groups {
            pending += self.store.llen(&queue.pending(Some(group))).await?
                + self.store.zcard(&queue.priority_pending(Some(group))).await?;
        }
        let waiting = self.store.zcard(&queue.scheduled()).await?
            + self.store.zcard(&queue.delayed()).await?;
        if pending + waiting > 0 || !processing.is_empty() {
            return Err(QueueError::NotEmpty(queue.clone()));
        }

        let mut tx = Transaction::new();
        for group in &groups {
            tx.del(queue.pending(Some(group)))
                .del(queue.priority_pending(Some(group)));
        }
        tx.del(queue.properties())
            .del(queue.pending(None))
            .del(queue.priority_pending(None))
            .del(queue.priority_sequence())
            .del(queue.scheduled())
            .del(queue.delayed())
            .del(queue.acknowledged())
            .del(queue.dead_lettered())
            .del(queue.consumer_groups())
            .del(queue.rate_limit())
            .del(queue.processing_queues())
            .srem(KeySchema::queues(), queue.to_string());

        let ns_in_use = self
            .list()
            .await?
            .iter()
            .any(|other| other.ns == queue.ns && other != queue);
        if !ns_in_use {
            tx.srem(KeySchema::namespaces(), &queue.ns);
        }
        self.store.commit(tx).await?;

        info!(queue = %queue, "Queue deleted");
        self.notifier
            .notify(SystemEvent::QueueDeleted {
                queue: queue.clone(),
            })
            .await;
        Ok(())
    }
}
