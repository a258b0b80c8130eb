//! Consumer liveness.
//!
//! Each running consumer rewrites its record in the global heartbeat hash
//! every second. Records never expire on their own: readers judge liveness
//! by age, and the garbage collector deletes records that went stale.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::Error;
use crate::keys::KeySchema;
use crate::message::now_ms;
use crate::store::{Store, StoreResult, Transaction};
use crate::supervisor::ShutdownListener;

/// Default interval between two heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// A consumer whose last heartbeat is older than this is presumed dead.
pub const LIVENESS_WINDOW_MS: i64 = 10_000;

/// Snapshot of the process behind a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub hostname: String,
    pub pid: u32,
    pub uptime_ms: u64,
}

/// Value stored per consumer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub timestamp: i64,
    pub resources: ResourceSnapshot,
}

impl HeartbeatRecord {
    pub fn is_alive_at(&self, now: i64) -> bool {
        now - self.timestamp <= LIVENESS_WINDOW_MS
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Publishes the liveness of one consumer.
#[derive(Clone)]
pub struct ConsumerHeartbeat {
    store: Arc<dyn Store>,
    consumer_id: String,
    interval: Duration,
    hostname: String,
    started: Instant,
}

impl ConsumerHeartbeat {
    pub fn new(store: Arc<dyn Store>, consumer_id: impl Into<String>) -> Self {
        Self {
            store,
            consumer_id: consumer_id.into(),
            interval: HEARTBEAT_INTERVAL,
            hostname: local_hostname(),
            started: Instant::now(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    fn record(&self) -> HeartbeatRecord {
        HeartbeatRecord {
            timestamp: now_ms(),
            resources: ResourceSnapshot {
                hostname: self.hostname.clone(),
                pid: std::process::id(),
                uptime_ms: self.started.elapsed().as_millis() as u64,
            },
        }
    }

    /// Write one heartbeat.
    pub async fn beat(&self) -> StoreResult<()> {
        let payload = serde_json::to_string(&self.record())?;
        let mut tx = Transaction::new();
        tx.hset(KeySchema::heartbeats(), &self.consumer_id, payload);
        self.store.commit(tx).await
    }

    /// Delete this consumer's record.
    pub async fn remove(&self) -> StoreResult<()> {
        let mut tx = Transaction::new();
        tx.hdel(KeySchema::heartbeats(), &self.consumer_id);
        self.store.commit(tx).await
    }

    /// Beat until shutdown.
    ///
    /// The record stays behind: the owner calls [`remove`](Self::remove)
    /// once nothing it holds is in flight. A failed write is logged and
    /// retried on the next tick; the consumer only looks dead to others
    /// once the liveness window has passed.
    #[instrument(skip_all, fields(consumer_id = %self.consumer_id))]
    pub async fn run(self, mut shutdown: ShutdownListener) -> Result<(), Error> {
        info!("Heartbeat started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!(error = %e, "Failed to write heartbeat");
                    }
                }
            }
        }

        info!("Heartbeat stopped");
        Ok(())
    }
}

/// Read the heartbeat record of `consumer_id`.
pub async fn get_heartbeat(
    store: &dyn Store,
    consumer_id: &str,
) -> StoreResult<Option<HeartbeatRecord>> {
    let Some(raw) = store.hget(&KeySchema::heartbeats(), consumer_id).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(consumer_id = %consumer_id, error = %e, "Unreadable heartbeat record");
            Ok(None)
        }
    }
}

pub async fn is_alive(store: &dyn Store, consumer_id: &str) -> StoreResult<bool> {
    is_alive_at(store, consumer_id, now_ms()).await
}

/// Whether `consumer_id` sent a heartbeat within the liveness window before
/// `now`. A missing or unreadable record means dead.
pub async fn is_alive_at(store: &dyn Store, consumer_id: &str, now: i64) -> StoreResult<bool> {
    Ok(get_heartbeat(store, consumer_id)
        .await?
        .is_some_and(|record| record.is_alive_at(now)))
}

/// Delete every heartbeat record that is stale at `now`. Returns how many
/// were deleted.
pub async fn reap_expired(store: &dyn Store, now: i64) -> StoreResult<usize> {
    let key = KeySchema::heartbeats();
    let records = store.hgetall(&key).await?;

    let mut tx = Transaction::new();
    let mut reaped = 0;
    for (consumer_id, raw) in records {
        let stale = serde_json::from_str::<HeartbeatRecord>(&raw)
            .map(|record| !record.is_alive_at(now))
            .unwrap_or(true);
        if stale {
            debug!(consumer_id = %consumer_id, "Reaping stale heartbeat");
            tx.hdel(&key, consumer_id);
            reaped += 1;
        }
    }
    store.commit(tx).await?;
    Ok(reaped)
}
