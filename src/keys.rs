//! Key derivation for every entity redq stores in Redis.
//!
//! Every key follows `redq:{namespace}:{entity}:{ids...}`. Queue-scoped keys
//! live in the queue's own namespace; cluster-wide indexes (heartbeats,
//! processing queues, locks) live in the reserved `global` namespace, which
//! configuration can never claim.
//!
//! ```text
//! redq:orders:queue-pending:checkout
//! redq:orders:queue-processing:checkout:4f1c...:billing
//! redq:global:lock:gc
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Prefix shared by every key.
pub const KEY_PREFIX: &str = "redq";

/// Namespace reserved for cluster-wide indexes.
pub const GLOBAL_NAMESPACE: &str = "global";

const SEPARATOR: char = ':';

/// Key errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid name '{0}': expected lowercase letters, digits, '-', '_' or '.'")]
    InvalidName(String),

    #[error("namespace '{0}' is reserved")]
    ReservedNamespace(String),

    #[error("malformed queue name '{0}'")]
    InvalidQueueName(String),

    #[error("malformed processing queue key '{0}'")]
    InvalidProcessingQueueKey(String),
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*$").expect("name pattern is a valid regex")
    })
}

/// Check that `name` can be used as a namespace, queue, group or consumer id.
///
/// Names never contain the key separator, which keeps processing queue keys
/// parseable.
pub fn validate_name(name: &str) -> Result<(), KeyError> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(KeyError::InvalidName(name.to_string()))
    }
}

/// Entity types that appear as the third key segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    QueuePending,
    QueuePriorityPending,
    QueuePrioritySequence,
    QueueProcessing,
    QueueProcessingQueues,
    QueueScheduled,
    QueueDelayed,
    QueueAcknowledged,
    QueueDeadLettered,
    QueueProperties,
    QueueConsumerGroups,
    QueueRateLimit,
    Message,
    Heartbeats,
    ProcessingQueues,
    Queues,
    Namespaces,
    Lock,
    Events,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::QueuePending => "queue-pending",
            KeyKind::QueuePriorityPending => "queue-priority-pending",
            KeyKind::QueuePrioritySequence => "queue-priority-sequence",
            KeyKind::QueueProcessing => "queue-processing",
            KeyKind::QueueProcessingQueues => "queue-processing-queues",
            KeyKind::QueueScheduled => "queue-scheduled",
            KeyKind::QueueDelayed => "queue-delayed",
            KeyKind::QueueAcknowledged => "queue-acknowledged",
            KeyKind::QueueDeadLettered => "queue-dead-letter",
            KeyKind::QueueProperties => "queue-properties",
            KeyKind::QueueConsumerGroups => "queue-consumer-groups",
            KeyKind::QueueRateLimit => "queue-rate-limit",
            KeyKind::Message => "message",
            KeyKind::Heartbeats => "heartbeat-index",
            KeyKind::ProcessingQueues => "processing-queue-index",
            KeyKind::Queues => "queue-index",
            KeyKind::Namespaces => "namespace-index",
            KeyKind::Lock => "lock",
            KeyKind::Events => "events",
        }
    }
}

fn join(namespace: &str, kind: KeyKind, ids: &[&str]) -> String {
    let mut key = format!("{KEY_PREFIX}{SEPARATOR}{namespace}{SEPARATOR}{}", kind.as_str());
    for id in ids {
        key.push(SEPARATOR);
        key.push_str(id);
    }
    key
}

/// Resolves queue names against the configured namespace and derives the
/// cluster-wide keys.
#[derive(Debug, Clone)]
pub struct KeySchema {
    namespace: String,
}

impl KeySchema {
    /// Create a schema for `namespace`, rejecting invalid or reserved names.
    pub fn new(namespace: impl Into<String>) -> Result<Self, KeyError> {
        let namespace = namespace.into();
        validate_name(&namespace)?;
        if namespace == GLOBAL_NAMESPACE {
            return Err(KeyError::ReservedNamespace(namespace));
        }
        Ok(Self { namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resolve `name` or `name@namespace` to a queue name. Bare names land
    /// in the configured namespace.
    pub fn queue(&self, name: &str) -> Result<QueueName, KeyError> {
        match name.split_once('@') {
            Some(_) => name.parse(),
            None => QueueName::new(&self.namespace, name),
        }
    }

    /// Hash of consumer id to heartbeat record.
    pub fn heartbeats() -> String {
        join(GLOBAL_NAMESPACE, KeyKind::Heartbeats, &[])
    }

    /// Hash of processing queue key to owning consumer id.
    pub fn processing_queues() -> String {
        join(GLOBAL_NAMESPACE, KeyKind::ProcessingQueues, &[])
    }

    /// Set of every queue, stored as `name@namespace`.
    pub fn queues() -> String {
        join(GLOBAL_NAMESPACE, KeyKind::Queues, &[])
    }

    /// Set of namespaces that hold at least one queue.
    pub fn namespaces() -> String {
        join(GLOBAL_NAMESPACE, KeyKind::Namespaces, &[])
    }

    /// Lock key for a cluster-wide role such as `gc` or `scheduler`.
    pub fn lock(purpose: &str) -> String {
        join(GLOBAL_NAMESPACE, KeyKind::Lock, &[purpose])
    }

    /// Pub/sub channel for system events.
    pub fn events_channel() -> String {
        join(GLOBAL_NAMESPACE, KeyKind::Events, &[])
    }
}

/// A queue identity: `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName {
    pub ns: String,
    pub name: String,
}

impl QueueName {
    pub fn new(ns: &str, name: &str) -> Result<Self, KeyError> {
        validate_name(ns)?;
        validate_name(name)?;
        if ns == GLOBAL_NAMESPACE {
            return Err(KeyError::ReservedNamespace(ns.to_string()));
        }
        Ok(Self {
            ns: ns.to_string(),
            name: name.to_string(),
        })
    }

    fn key(&self, kind: KeyKind, ids: &[&str]) -> String {
        let mut parts = Vec::with_capacity(ids.len() + 1);
        parts.push(self.name.as_str());
        parts.extend_from_slice(ids);
        join(&self.ns, kind, &parts)
    }

    /// Pending list for point-to-point delivery or for one consumer group.
    pub fn pending(&self, group: Option<&str>) -> String {
        match group {
            Some(group) => self.key(KeyKind::QueuePending, &[group]),
            None => self.key(KeyKind::QueuePending, &[]),
        }
    }

    pub fn priority_pending(&self, group: Option<&str>) -> String {
        match group {
            Some(group) => self.key(KeyKind::QueuePriorityPending, &[group]),
            None => self.key(KeyKind::QueuePriorityPending, &[]),
        }
    }

    /// Counter giving priority entries an insertion-order tie-break.
    pub fn priority_sequence(&self) -> String {
        self.key(KeyKind::QueuePrioritySequence, &[])
    }

    /// Hash of this queue's processing queue keys to their owners.
    pub fn processing_queues(&self) -> String {
        self.key(KeyKind::QueueProcessingQueues, &[])
    }

    pub fn scheduled(&self) -> String {
        self.key(KeyKind::QueueScheduled, &[])
    }

    pub fn delayed(&self) -> String {
        self.key(KeyKind::QueueDelayed, &[])
    }

    pub fn acknowledged(&self) -> String {
        self.key(KeyKind::QueueAcknowledged, &[])
    }

    pub fn dead_lettered(&self) -> String {
        self.key(KeyKind::QueueDeadLettered, &[])
    }

    pub fn properties(&self) -> String {
        self.key(KeyKind::QueueProperties, &[])
    }

    pub fn consumer_groups(&self) -> String {
        self.key(KeyKind::QueueConsumerGroups, &[])
    }

    pub fn rate_limit(&self) -> String {
        self.key(KeyKind::QueueRateLimit, &[])
    }

    /// Message hash key. Messages share their queue's namespace.
    pub fn message(&self, id: &uuid::Uuid) -> String {
        format!("{}{}", self.message_prefix(), id)
    }

    /// Prefix that completes to a message key when an id is appended.
    pub fn message_prefix(&self) -> String {
        let mut prefix = join(&self.ns, KeyKind::Message, &[]);
        prefix.push(SEPARATOR);
        prefix
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.ns)
    }
}

impl FromStr for QueueName {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, ns) = s
            .split_once('@')
            .ok_or_else(|| KeyError::InvalidQueueName(s.to_string()))?;
        QueueName::new(ns, name).map_err(|_| KeyError::InvalidQueueName(s.to_string()))
    }
}

/// The single-owner holding area of one consumer on one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessingQueue {
    pub queue: QueueName,
    pub consumer_id: String,
    pub group: Option<String>,
}

impl ProcessingQueue {
    pub fn new(queue: QueueName, consumer_id: impl Into<String>, group: Option<String>) -> Self {
        Self {
            queue,
            consumer_id: consumer_id.into(),
            group,
        }
    }

    /// `redq:{ns}:queue-processing:{queue}:{consumer}[:{group}]`
    pub fn key(&self) -> String {
        match &self.group {
            Some(group) => self
                .queue
                .key(KeyKind::QueueProcessing, &[&self.consumer_id, group]),
            None => self.queue.key(KeyKind::QueueProcessing, &[&self.consumer_id]),
        }
    }

    /// Pending structure this processing queue is fed from.
    pub fn pending(&self) -> String {
        self.queue.pending(self.group.as_deref())
    }

    pub fn priority_pending(&self) -> String {
        self.queue.priority_pending(self.group.as_deref())
    }

    /// Parse a processing queue key back into its parts.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let invalid = || KeyError::InvalidProcessingQueueKey(key.to_string());
        let processing = KeyKind::QueueProcessing.as_str();
        let parts: Vec<&str> = key.split(SEPARATOR).collect();
        let (ns, queue, consumer_id, group) = match parts.as_slice() {
            [KEY_PREFIX, ns, kind, queue, consumer] if *kind == processing => {
                (*ns, *queue, *consumer, None)
            }
            [KEY_PREFIX, ns, kind, queue, consumer, group] if *kind == processing => {
                (*ns, *queue, *consumer, Some(group.to_string()))
            }
            _ => return Err(invalid()),
        };
        let queue = QueueName::new(ns, queue).map_err(|_| invalid())?;
        validate_name(consumer_id).map_err(|_| invalid())?;
        if let Some(group) = &group {
            validate_name(group).map_err(|_| invalid())?;
        }
        Ok(Self::new(queue, consumer_id, group))
    }
}

impl fmt::Display for ProcessingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
