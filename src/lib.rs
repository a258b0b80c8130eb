//! # redq
//!
//! A reliable message queue on top of Redis.
//!
//! Messages are published to named queues (FIFO, LIFO or priority, point to
//! point or pub/sub), moved atomically into a consumer's own processing
//! queue when delivered, and settled by acknowledgement, retry, delayed
//! retry or dead-lettering. Consumers prove they are alive with heartbeats;
//! a garbage collector returns the messages of dead consumers, and a
//! scheduler activates delayed, cron and repeating messages.
//!
//! ## Architecture
//!
//! ```text
//! Producer -> Broker -> pending -> Consumer worker -> processing -> ack | retry | dead-letter
//!                   \-> scheduled / delayed -> Scheduler -/
//! ```
//!
//! ## Modules
//!
//! - [`keys`]: key naming for every stored structure
//! - [`store`]: the storage contract, with Redis and in-memory implementations
//! - [`message`]: messages, their state machine, retry and schedule rules
//! - [`broker`]: every atomic message transition
//! - [`consumer`]: workers, heartbeat, GC and scheduler under one supervisor
//! - [`handler`]: the [`MessageHandler`] trait

pub mod archive;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod gc;
pub mod handler;
pub mod heartbeat;
pub mod keys;
pub mod lock;
pub mod logging;
pub mod message;
pub mod notify;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod supervisor;

// Re-export commonly used types at crate root
pub use broker::{Broker, BrokerConfig, BrokerError, BrokerEvent};
pub use config::RedqConfig;
pub use consumer::{Consumer, ConsumerOptions};
pub use error::{Error, Result};
pub use handler::{HandlerError, HandlerRegistry, LogHandler, MessageHandler};
pub use keys::{KeySchema, QueueName};
pub use message::{Message, MessageEnvelope, MessageStatus};
pub use queue::{DeliveryModel, QueueManager, QueueParams, QueueType};
pub use store::{MemoryStore, RedisStore, Store};
pub use supervisor::ShutdownSignal;
