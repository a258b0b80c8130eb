//! Redis-backed [`Store`] over a `deadpool-redis` pool.
//!
//! Short request/response commands borrow pooled connections. Blocking pops
//! run on a connection owned by one [`RedisStore::dedicated`] handle, and
//! subscriptions open their own pub/sub connection.

use async_trait::async_trait;
use deadpool_redis::redis::aio::MultiplexedConnection;
use deadpool_redis::redis::{cmd, pipe, Client, RedisError, Script, Value};
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use super::{ScriptCall, ScriptName, ScriptReply, Store, StoreError, StoreResult, Transaction, TxOp};

/// Buffered pub/sub payloads per subscription.
const SUBSCRIPTION_BUFFER: usize = 64;

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::ConnectionError(e.to_string())
        } else {
            StoreError::RedisError(e.to_string())
        }
    }
}

/// Redis store.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    client: Client,
    scripts: Arc<HashMap<ScriptName, Script>>,
    blocking: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl RedisStore {
    /// Create a store for `url` with at most `pool_size` pooled connections.
    pub fn connect(url: &str, pool_size: usize) -> StoreResult<Self> {
        let mut cfg = Config::from_url(url);
        cfg.pool = Some(PoolConfig::new(pool_size));
        let pool = cfg.create_pool(Some(Runtime::Tokio1)).map_err(|e| {
            error!(error = %e, "Failed to create Redis pool");
            StoreError::ConnectionError(e.to_string())
        })?;
        let client = Client::open(url)?;

        let scripts = ScriptName::ALL
            .iter()
            .map(|name| (*name, Script::new(name.source())))
            .collect();

        Ok(Self {
            pool,
            client,
            scripts: Arc::new(scripts),
            blocking: Arc::new(Mutex::new(None)),
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> StoreResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection");
            StoreError::ConnectionError(e.to_string())
        })
    }
}

/// Map a raw script reply onto the `OK` / reason / nil convention.
fn script_reply(name: ScriptName, value: Value) -> StoreResult<ScriptReply> {
    let text = |s: String| {
        if s == "OK" {
            ScriptReply::Ok
        } else {
            ScriptReply::Text(s)
        }
    };

    match value {
        Value::Nil => Ok(ScriptReply::Nil),
        Value::Okay => Ok(ScriptReply::Ok),
        Value::Int(n) => Ok(ScriptReply::Int(n)),
        Value::SimpleString(s) => Ok(text(s)),
        Value::BulkString(bytes) => Ok(text(String::from_utf8_lossy(&bytes).into_owned())),
        other => Err(StoreError::UnexpectedReply {
            script: name.to_string(),
            reply: format!("{other:?}"),
        }),
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let count: i64 = cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = cmd("HGET").arg(key).arg(field).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> = cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(map)
    }

    async fn hlen(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = cmd("HLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let items: Vec<String> = cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn zrange_by_score(&self, key: &str, max: f64, limit: usize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let reply: Value = cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(!matches!(reply, Value::Nil))
    }

    async fn eval(&self, call: ScriptCall) -> StoreResult<ScriptReply> {
        let script = self
            .scripts
            .get(&call.name)
            .ok_or_else(|| StoreError::RedisError(format!("script {} not loaded", call.name)))?;

        let mut invocation = script.prepare_invoke();
        for key in &call.keys {
            invocation.key(key);
        }
        for arg in &call.args {
            invocation.arg(arg);
        }

        let mut conn = self.conn().await?;
        let value: Value = invocation.invoke_async(&mut conn).await?;
        script_reply(call.name, value)
    }

    async fn blocking_move(
        &self,
        source: &str,
        destination: &str,
        timeout: Option<Duration>,
    ) -> StoreResult<Option<String>> {
        let mut slot = self.blocking.lock().await;
        // The connection is taken out of the slot for the duration of the
        // call. If this future is dropped mid-wait the connection is dropped
        // with it instead of being reused while still blocked.
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => {
                debug!("Opening dedicated Redis connection");
                self.client.get_multiplexed_async_connection().await?
            }
        };

        let seconds = timeout.map(|t| t.as_secs().max(1)).unwrap_or(0);
        let id: Option<String> = cmd("BRPOPLPUSH")
            .arg(source)
            .arg(destination)
            .arg(seconds)
            .query_async(&mut conn)
            .await?;

        *slot = Some(conn);
        Ok(id)
    }

    async fn commit(&self, tx: Transaction) -> StoreResult<()> {
        if tx.is_empty() {
            return Ok(());
        }

        let mut pipeline = pipe();
        pipeline.atomic();
        for op in tx.into_ops() {
            match op {
                TxOp::Del { key } => pipeline.cmd("DEL").arg(key).ignore(),
                TxOp::HSet { key, field, value } => {
                    pipeline.cmd("HSET").arg(key).arg(field).arg(value).ignore()
                }
                TxOp::HDel { key, field } => pipeline.cmd("HDEL").arg(key).arg(field).ignore(),
                TxOp::LPush { key, value } => pipeline.cmd("LPUSH").arg(key).arg(value).ignore(),
                TxOp::LRem { key, value } => {
                    pipeline.cmd("LREM").arg(key).arg(0).arg(value).ignore()
                }
                TxOp::LTrim { key, start, stop } => {
                    pipeline.cmd("LTRIM").arg(key).arg(start).arg(stop).ignore()
                }
                TxOp::PExpire { key, ttl_ms } => {
                    pipeline.cmd("PEXPIRE").arg(key).arg(ttl_ms).ignore()
                }
                TxOp::ZAdd { key, score, member } => {
                    pipeline.cmd("ZADD").arg(key).arg(score).arg(member).ignore()
                }
                TxOp::ZRem { key, member } => pipeline.cmd("ZREM").arg(key).arg(member).ignore(),
                TxOp::SAdd { key, member } => pipeline.cmd("SADD").arg(key).arg(member).ignore(),
                TxOp::SRem { key, member } => pipeline.cmd("SREM").arg(key).arg(member).ignore(),
            };
        }

        let mut conn = self.conn().await?;
        let _: () = pipeline.query_async(&mut conn).await.map_err(|e| {
            error!(error = %e, "Transaction failed");
            StoreError::from(e)
        })?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _receivers: i64 = cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::Receiver<String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        if sender.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "Dropping undecodable payload"),
                }
            }
            debug!(channel = %channel, "Subscription closed");
        });

        Ok(receiver)
    }

    fn dedicated(&self) -> Arc<dyn Store> {
        Arc::new(Self {
            pool: self.pool.clone(),
            client: self.client.clone(),
            scripts: self.scripts.clone(),
            blocking: Arc::new(Mutex::new(None)),
        })
    }
}
