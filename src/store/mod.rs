//! The storage collaborator every redq role talks to.
//!
//! Callers pick one of two call shapes at the call site:
//!
//! - immediate commands on [`Store`] (reads, `SET NX PX`, blocking pops,
//!   server-side scripts), each applied on its own;
//! - a [`Transaction`] built up front and applied all-or-nothing with
//!   [`Store::commit`].
//!
//! Scripts carry their precondition checks server-side and answer with
//! [`ScriptReply`]: `OK`, a named failure reason, or nil for the no-op case.
//!
//! [`RedisStore`] is the production implementation. [`MemoryStore`] emulates
//! the same semantics in-process.

pub mod memory;
pub mod redis;
pub mod scripts;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::scripts::{ScriptCall, ScriptName, ScriptReply};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("redis error: {0}")]
    RedisError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("WRONGTYPE operation against key '{0}'")]
    WrongType(String),

    #[error("unexpected reply from {script}: {reply}")]
    UnexpectedReply { script: String, reply: String },
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::SerializationError(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One write queued inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum TxOp {
    Del { key: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    LPush { key: String, value: String },
    LRem { key: String, value: String },
    LTrim { key: String, start: i64, stop: i64 },
    PExpire { key: String, ttl_ms: u64 },
    ZAdd { key: String, score: f64, member: String },
    ZRem { key: String, member: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
}

/// Writes applied together by [`Store::commit`], all or nothing.
#[derive(Debug, Default, Clone)]
pub struct Transaction {
    ops: Vec<TxOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[TxOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<TxOp> {
        self.ops
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::Del { key: key.into() });
        self
    }

    pub fn hset(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(TxOp::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn hdel(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::HDel {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    pub fn lpush(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::LPush {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Remove every occurrence of `value` from a list.
    pub fn lrem(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::LRem {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn ltrim(&mut self, key: impl Into<String>, start: i64, stop: i64) -> &mut Self {
        self.ops.push(TxOp::LTrim {
            key: key.into(),
            start,
            stop,
        });
        self
    }

    pub fn pexpire(&mut self, key: impl Into<String>, ttl_ms: u64) -> &mut Self {
        self.ops.push(TxOp::PExpire {
            key: key.into(),
            ttl_ms,
        });
        self
    }

    pub fn zadd(&mut self, key: impl Into<String>, score: f64, member: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::ZAdd {
            key: key.into(),
            score,
            member: member.into(),
        });
        self
    }

    pub fn zrem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::ZRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::SRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }
}

/// Storage trait for all redq persistence. Implementations must be thread-safe.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Immediate reads ---

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hlen(&self, key: &str) -> StoreResult<u64>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    async fn llen(&self, key: &str) -> StoreResult<u64>;

    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Members scored at most `max`, lowest score first, at most `limit` of them.
    async fn zrange_by_score(&self, key: &str, max: f64, limit: usize) -> StoreResult<Vec<String>>;

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    // --- Immediate writes ---

    /// `SET key value NX PX ttl`. Returns whether the key was set.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool>;

    /// Run a server-side script atomically.
    async fn eval(&self, call: ScriptCall) -> StoreResult<ScriptReply>;

    /// Pop the tail of `source` and push it onto `destination`, waiting up to
    /// `timeout` (`None` waits forever). Only call this on a handle obtained
    /// from [`Store::dedicated`]; the connection is unusable while blocked.
    async fn blocking_move(
        &self,
        source: &str,
        destination: &str,
        timeout: Option<Duration>,
    ) -> StoreResult<Option<String>>;

    // --- Transactions ---

    /// Apply every queued write together or not at all.
    async fn commit(&self, tx: Transaction) -> StoreResult<()>;

    // --- Pub/sub ---

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    /// Subscribe to `channel`. The receiver closes when the subscription ends.
    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::Receiver<String>>;

    /// A handle sharing the same data whose blocking operations run on a
    /// connection reserved for it alone.
    fn dedicated(&self) -> Arc<dyn Store>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_builder_keeps_order() {
        let mut tx = Transaction::new();
        tx.lrem("processing", "m1")
            .hset("message", "status", "ACKNOWLEDGED")
            .lpush("archive", "{}")
            .ltrim("archive", 0, 99);

        assert_eq!(tx.ops().len(), 4);
        assert_eq!(
            tx.ops()[0],
            TxOp::LRem {
                key: "processing".to_string(),
                value: "m1".to_string()
            }
        );
        assert!(matches!(tx.ops()[3], TxOp::LTrim { stop: 99, .. }));
    }

    #[test]
    fn test_empty_transaction() {
        assert!(Transaction::new().is_empty());
    }
}
