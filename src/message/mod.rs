//! Message types and their lifecycle.
//!
//! A [`Message`] is what a producer builds: a JSON body plus optional
//! priority, delivery overrides and scheduling parameters. Publishing wraps
//! it in a [`MessageEnvelope`] that adds the id, destination queue, resolved
//! [`DeliverySettings`] and mutable [`MessageState`].
//!
//! Status moves along
//!
//! ```text
//! SCHEDULED -> PENDING -> PROCESSING -> ACKNOWLEDGED | DEAD_LETTERED
//!                 ^            |
//!                 +-- DELAYED -+  (or straight back to PENDING)
//! ```
//!
//! # Example
//!
//! ```json
//! {
//!   "body": {"orderId": 42},
//!   "priority": 5,
//!   "overrides": {"retryThreshold": 5},
//!   "schedule": {"cron": "0 */5 * * * *", "repeat": 2, "repeatPeriodMs": 10000},
//!   "createdAt": 1733913600000
//! }
//! ```

pub mod retry;
pub mod schedule;

pub use retry::{retry_decision, DeadLetterCause, RetryAction, RetryCause, RetryInput};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::keys::QueueName;
use crate::store::scripts::MAX_PRIORITY;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Errors raised while validating a message before publish.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("priority {0} is out of range (0..={MAX_PRIORITY})")]
    InvalidPriority(u8),

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("a repeat count requires a positive repeat period")]
    RepeatWithoutPeriod,
}

/// Lifecycle status of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Scheduled,
    #[default]
    Pending,
    Processing,
    Delayed,
    Acknowledged,
    DeadLettered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "SCHEDULED",
            MessageStatus::Pending => "PENDING",
            MessageStatus::Processing => "PROCESSING",
            MessageStatus::Delayed => "DELAYED",
            MessageStatus::Acknowledged => "ACKNOWLEDGED",
            MessageStatus::DeadLettered => "DEAD_LETTERED",
        }
    }

    /// Whether the lifecycle graph has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Scheduled, Pending)
                | (Delayed, Pending)
                | (Pending, Processing)
                | (Processing, Pending)
                | (Processing, Delayed)
                | (Processing, Acknowledged)
                | (Processing, DeadLettered)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Acknowledged | MessageStatus::DeadLettered)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(MessageStatus::Scheduled),
            "PENDING" => Ok(MessageStatus::Pending),
            "PROCESSING" => Ok(MessageStatus::Processing),
            "DELAYED" => Ok(MessageStatus::Delayed),
            "ACKNOWLEDGED" => Ok(MessageStatus::Acknowledged),
            "DEAD_LETTERED" => Ok(MessageStatus::DeadLettered),
            other => Err(format!("unknown message status '{other}'")),
        }
    }
}

/// Optional per-message or per-queue overrides of the delivery defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_threshold: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consume_timeout_ms: Option<u64>,
}

/// Effective delivery settings of a published message. Zero disables TTL,
/// retry delay and consume timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    pub ttl_ms: u64,
    pub retry_threshold: u32,
    pub retry_delay_ms: u64,
    pub consume_timeout_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            ttl_ms: 0,
            retry_threshold: 3,
            retry_delay_ms: 60_000,
            consume_timeout_ms: 0,
        }
    }
}

impl DeliverySettings {
    /// Message overrides win over queue overrides, which win over `self`.
    pub fn resolve(&self, message: &DeliveryOverrides, queue: &DeliveryOverrides) -> Self {
        Self {
            ttl_ms: message.ttl_ms.or(queue.ttl_ms).unwrap_or(self.ttl_ms),
            retry_threshold: message
                .retry_threshold
                .or(queue.retry_threshold)
                .unwrap_or(self.retry_threshold),
            retry_delay_ms: message
                .retry_delay_ms
                .or(queue.retry_delay_ms)
                .unwrap_or(self.retry_delay_ms),
            consume_timeout_ms: message
                .consume_timeout_ms
                .or(queue.consume_timeout_ms)
                .unwrap_or(self.consume_timeout_ms),
        }
    }
}

/// Scheduling parameters. Any of them makes a message schedulable; cron or
/// a positive repeat count makes it periodic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    /// Six-field cron expression (seconds first), evaluated in UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    #[serde(default)]
    pub repeat: u32,

    #[serde(default)]
    pub repeat_period_ms: u64,
}

impl ScheduleParams {
    pub fn is_periodic(&self) -> bool {
        self.cron.is_some() || self.repeat > 0
    }

    pub fn is_schedulable(&self) -> bool {
        self.delay_ms.is_some_and(|d| d > 0) || self.is_periodic()
    }
}

/// A message as built by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub body: Value,

    /// 0 (lowest) to 7 (highest). Required by priority queues, rejected by others.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,

    #[serde(default)]
    pub overrides: DeliveryOverrides,

    #[serde(default)]
    pub schedule: ScheduleParams,

    pub created_at: i64,
}

impl Message {
    /// Create a new message with a JSON body
    pub fn new(body: Value) -> Self {
        Self {
            body,
            priority: None,
            overrides: DeliveryOverrides::default(),
            schedule: ScheduleParams::default(),
            created_at: now_ms(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.overrides.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_retry_threshold(mut self, threshold: u32) -> Self {
        self.overrides.retry_threshold = Some(threshold);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.overrides.retry_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_consume_timeout(mut self, timeout: Duration) -> Self {
        self.overrides.consume_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Deliver once, `delay` after publish.
    pub fn with_schedule_delay(mut self, delay: Duration) -> Self {
        self.schedule.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_schedule_cron(mut self, expr: impl Into<String>) -> Self {
        self.schedule.cron = Some(expr.into());
        self
    }

    /// Deliver `count` more times, `period` apart.
    pub fn with_schedule_repeat(mut self, count: u32, period: Duration) -> Self {
        self.schedule.repeat = count;
        self.schedule.repeat_period_ms = period.as_millis() as u64;
        self
    }

    /// Check the fields a queue cannot check for us.
    pub fn validate(&self) -> Result<(), MessageError> {
        if let Some(priority) = self.priority {
            if priority > MAX_PRIORITY {
                return Err(MessageError::InvalidPriority(priority));
            }
        }
        if let Some(expr) = &self.schedule.cron {
            schedule::parse_cron(expr)?;
        }
        if self.schedule.repeat > 0 && self.schedule.repeat_period_ms == 0 {
            return Err(MessageError::RepeatWithoutPeriod);
        }
        Ok(())
    }
}

/// Mutable delivery state, rewritten by every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageState {
    pub status: MessageStatus,

    /// Completed retries. Never decreases.
    pub attempts: u32,

    pub published_at: Option<i64>,
    pub scheduled_at: Option<i64>,
    pub expired: bool,

    pub scheduled_delay_applied: bool,
    pub scheduled_cron_fired: bool,
    pub scheduled_repeat_count: u32,

    pub last_retry_cause: Option<RetryCause>,
    pub dead_letter_cause: Option<DeadLetterCause>,
    pub acknowledged_at: Option<i64>,
    pub dead_lettered_at: Option<i64>,
}

/// A published message with its identity and delivery state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: Uuid,
    pub queue: QueueName,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_group: Option<String>,

    pub message: Message,
    pub settings: DeliverySettings,
    pub state: MessageState,
}

impl MessageEnvelope {
    pub fn new(
        queue: QueueName,
        consumer_group: Option<String>,
        message: Message,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue,
            consumer_group,
            message,
            settings,
            state: MessageState::default(),
        }
    }

    /// Key of the message hash.
    pub fn key(&self) -> String {
        self.queue.message(&self.id)
    }

    pub fn is_periodic(&self) -> bool {
        self.message.schedule.is_periodic()
    }

    /// TTL counts from the moment the message became pending.
    pub fn has_expired(&self, now: i64) -> bool {
        if self.state.expired {
            return true;
        }
        let ttl = self.settings.ttl_ms;
        if ttl == 0 {
            return false;
        }
        let since = self.state.published_at.unwrap_or(self.message.created_at);
        since.saturating_add(ttl as i64) <= now
    }

    /// Inputs of the retry decision for the delivery that just failed.
    pub fn retry_input(&self, now: i64) -> RetryInput {
        RetryInput {
            delivery_attempts: self.state.attempts.saturating_add(1),
            retry_threshold: self.settings.retry_threshold,
            periodic: self.is_periodic(),
            expired: self.has_expired(now),
            retry_delay_ms: self.settings.retry_delay_ms,
        }
    }

    /// Priority as a script argument, empty when unset.
    pub fn priority_arg(&self) -> String {
        self.message.priority.map(|p| p.to_string()).unwrap_or_default()
    }

    /// A fresh instance for the next occurrence of a periodic message. It
    /// inherits the schedule progress but none of the delivery history.
    pub fn next_occurrence(&self, schedule_state: &MessageState, fire_at: i64) -> Self {
        let mut message = self.message.clone();
        message.created_at = now_ms();
        Self {
            id: Uuid::new_v4(),
            queue: self.queue.clone(),
            consumer_group: self.consumer_group.clone(),
            message,
            settings: self.settings,
            state: MessageState {
                status: MessageStatus::Scheduled,
                scheduled_at: Some(fire_at),
                scheduled_delay_applied: schedule_state.scheduled_delay_applied,
                scheduled_cron_fired: schedule_state.scheduled_cron_fired,
                scheduled_repeat_count: schedule_state.scheduled_repeat_count,
                ..MessageState::default()
            },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Rebuild an envelope from its stored hash fields. The `status` field
    /// is authoritative over the status inside `data`.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Option<Self>, serde_json::Error> {
        let Some(data) = fields.get("data") else {
            return Ok(None);
        };
        let mut envelope: Self = serde_json::from_str(data)?;
        if let Some(status) = fields.get("status").and_then(|s| s.parse().ok()) {
            envelope.state.status = status;
        }
        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(message: Message) -> MessageEnvelope {
        MessageEnvelope::new(
            QueueName::new("shop", "orders").unwrap(),
            None,
            message,
            DeliverySettings::default(),
        )
    }

    #[test]
    fn test_message_builder() {
        let message = Message::new(json!({"orderId": 42}))
            .with_priority(5)
            .with_retry_threshold(5)
            .with_schedule_repeat(2, Duration::from_secs(10));

        assert_eq!(message.priority, Some(5));
        assert_eq!(message.overrides.retry_threshold, Some(5));
        assert!(message.schedule.is_periodic());
        assert!(message.schedule.is_schedulable());
        assert!(message.validate().is_ok());
    }

    #[test]
    fn test_message_validation() {
        let message = Message::new(json!({})).with_priority(8);
        assert_eq!(message.validate(), Err(MessageError::InvalidPriority(8)));

        let message = Message::new(json!({})).with_schedule_cron("not cron");
        assert!(matches!(message.validate(), Err(MessageError::InvalidCron { .. })));

        let message = Message::new(json!({})).with_schedule_repeat(3, Duration::ZERO);
        assert_eq!(message.validate(), Err(MessageError::RepeatWithoutPeriod));
    }

    #[test]
    fn test_delay_alone_is_not_periodic() {
        let message = Message::new(json!({})).with_schedule_delay(Duration::from_secs(2));
        assert!(message.schedule.is_schedulable());
        assert!(!message.schedule.is_periodic());
    }

    #[test]
    fn test_settings_resolution_order() {
        let defaults = DeliverySettings::default();
        let queue = DeliveryOverrides {
            retry_threshold: Some(10),
            retry_delay_ms: Some(0),
            ..Default::default()
        };
        let message = DeliveryOverrides {
            retry_threshold: Some(1),
            ..Default::default()
        };

        let resolved = defaults.resolve(&message, &queue);
        assert_eq!(resolved.retry_threshold, 1);
        assert_eq!(resolved.retry_delay_ms, 0);
        assert_eq!(resolved.ttl_ms, 0);
    }

    #[test]
    fn test_status_graph() {
        use MessageStatus::*;
        assert!(Scheduled.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Delayed));
        assert!(Delayed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Acknowledged));
        assert!(!DeadLettered.can_transition_to(Pending));
        assert!(Acknowledged.is_terminal());
    }

    #[test]
    fn test_ttl_expiry() {
        let mut env = envelope(Message::new(json!({})));
        env.settings.ttl_ms = 1_000;
        env.state.published_at = Some(10_000);
        assert!(!env.has_expired(10_999));
        assert!(env.has_expired(11_000));

        env.settings.ttl_ms = 0;
        assert!(!env.has_expired(i64::MAX));
        env.state.expired = true;
        assert!(env.has_expired(0));
    }

    #[test]
    fn test_stored_status_wins() {
        let mut env = envelope(Message::new(json!({"a": 1})));
        env.state.status = MessageStatus::Pending;

        let mut fields = HashMap::new();
        fields.insert("data".to_string(), env.to_json().unwrap());
        fields.insert("status".to_string(), "PROCESSING".to_string());

        let loaded = MessageEnvelope::from_fields(&fields).unwrap().unwrap();
        assert_eq!(loaded.id, env.id);
        assert_eq!(loaded.state.status, MessageStatus::Processing);
        assert!(MessageEnvelope::from_fields(&HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_serialized_field_names() {
        let env = envelope(Message::new(json!({})).with_retry_threshold(2));
        let json_str = env.to_json().unwrap();
        assert!(json_str.contains("retryThreshold"));
        assert!(json_str.contains("createdAt"));
        assert!(!json_str.contains("consumerGroup"));
    }

    #[test]
    fn test_next_occurrence_is_a_fresh_instance() {
        let mut env = envelope(Message::new(json!({})).with_schedule_repeat(3, Duration::from_secs(1)));
        env.state.attempts = 2;
        let mut schedule_state = env.state.clone();
        schedule_state.scheduled_repeat_count = 1;

        let next = env.next_occurrence(&schedule_state, 5_000);
        assert_ne!(next.id, env.id);
        assert_eq!(next.state.attempts, 0);
        assert_eq!(next.state.status, MessageStatus::Scheduled);
        assert_eq!(next.state.scheduled_repeat_count, 1);
        assert_eq!(next.state.scheduled_at, Some(5_000));
    }
}
