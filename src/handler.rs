//! Message handlers.
//!
//! A handler receives each delivered message. Returning `Ok` acknowledges
//! the message; returning an error hands it to the retry decision.
//!
//! ## Creating Custom Handlers
//!
//! ```rust,ignore
//! use redq::{HandlerError, MessageEnvelope, MessageHandler};
//! use async_trait::async_trait;
//!
//! struct ChargeCard;
//!
//! #[async_trait]
//! impl MessageHandler for ChargeCard {
//!     fn name(&self) -> &str {
//!         "charge-card"
//!     }
//!
//!     async fn handle(&self, message: &MessageEnvelope) -> Result<(), HandlerError> {
//!         // Your logic here
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::message::MessageEnvelope;

/// Errors a handler may return. Any of them counts as a failed delivery.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic handler failure
    #[error("handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }
}

/// Processes delivered messages.
///
/// Handlers run on their own task and must be `Send + Sync`. A handler that
/// outlives the consume timeout is abandoned, not cancelled, so it should
/// not rely on being stopped.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Returns the unique name of this handler (e.g., "log", "charge-card")
    fn name(&self) -> &str;

    async fn handle(&self, message: &MessageEnvelope) -> Result<(), HandlerError>;
}

/// Handlers by name, for configuration-driven binding of subscriptions.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LogHandler::new()));
        registry
    }
}

/// A handler that logs every message and acknowledges it.
#[derive(Debug, Clone)]
pub struct LogHandler {
    prefix: String,
}

impl LogHandler {
    pub fn new() -> Self {
        Self {
            prefix: "message".to_string(),
        }
    }

    /// The prefix appears in log messages, useful for telling several log
    /// handlers apart.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, message: &MessageEnvelope) -> Result<(), HandlerError> {
        info!(
            prefix = %self.prefix,
            queue = %message.queue,
            message_id = %message.id,
            attempts = message.state.attempts,
            body = %message.message.body,
            "[{}] Consumed {}",
            self.prefix,
            message.id
        );
        Ok(())
    }
}
