//! What happens to a message whose delivery failed.

use serde::{Deserialize, Serialize};

/// Why a delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryCause {
    /// The handler returned an error.
    HandlerError,
    /// The handler did not finish within the consume timeout.
    ConsumeTimeout,
    /// The owning consumer stopped sending heartbeats.
    OfflineConsumer,
    /// The message outlived its TTL before it was handled.
    TtlExpired,
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterCause {
    RetryThresholdExceeded,
    TtlExpired,
    /// Periodic messages are never retried; their next occurrence is
    /// already scheduled.
    PeriodicMessage,
}

/// Outcome of [`retry_decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    DeadLetter(DeadLetterCause),
    Delay { delay_ms: u64 },
    Requeue,
}

/// Everything the decision looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryInput {
    /// Deliveries made so far, counting the one that just failed.
    pub delivery_attempts: u32,
    pub retry_threshold: u32,
    pub periodic: bool,
    pub expired: bool,
    pub retry_delay_ms: u64,
}

/// Decide the fate of a failed delivery. Rules are checked in order and the
/// first match wins.
pub fn retry_decision(input: &RetryInput) -> RetryAction {
    if input.expired {
        RetryAction::DeadLetter(DeadLetterCause::TtlExpired)
    } else if input.periodic {
        RetryAction::DeadLetter(DeadLetterCause::PeriodicMessage)
    } else if input.delivery_attempts >= input.retry_threshold {
        RetryAction::DeadLetter(DeadLetterCause::RetryThresholdExceeded)
    } else if input.retry_delay_ms > 0 {
        RetryAction::Delay {
            delay_ms: input.retry_delay_ms,
        }
    } else {
        RetryAction::Requeue
    }
}
