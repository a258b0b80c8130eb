//! Read access to finished messages.
//!
//! Acknowledged and dead-lettered messages are archived per queue as full
//! JSON envelopes, newest first, when the archive is enabled in
//! `[messages.store]`. Writers bound the archives with `LTRIM` and expiry;
//! this module only reads and purges them.
//!
//! # Example
//!
//! ```rust,ignore
//! use redq::archive::{ArchiveKind, MessageArchive};
//!
//! let archive = MessageArchive::new(store);
//! let dead = archive.list(&queue, ArchiveKind::DeadLettered, 0, 10).await?;
//! ```

use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::keys::QueueName;
use crate::message::MessageEnvelope;
use crate::store::{Store, StoreError, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Acknowledged,
    DeadLettered,
}

impl ArchiveKind {
    pub fn key(&self, queue: &QueueName) -> String {
        match self {
            ArchiveKind::Acknowledged => queue.acknowledged(),
            ArchiveKind::DeadLettered => queue.dead_lettered(),
        }
    }
}

#[derive(Clone)]
pub struct MessageArchive {
    store: Arc<dyn Store>,
}

impl MessageArchive {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn count(&self, queue: &QueueName, kind: ArchiveKind) -> Result<u64, StoreError> {
        self.store.llen(&kind.key(queue)).await
    }

    /// Up to `count` archived messages starting at `offset`, newest first.
    /// Entries that no longer decode are skipped.
    pub async fn list(
        &self,
        queue: &QueueName,
        kind: ArchiveKind,
        offset: usize,
        count: usize,
    ) -> Result<Vec<MessageEnvelope>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let start = offset as i64;
        let stop = start + count as i64 - 1;
        let raw = self
            .store
            .lrange(&kind.key(queue), start, stop)
            .await
            .map_err(|e| {
                error!(queue = %queue, error = %e, "Failed to read message archive");
                e
            })?;

        let result: Vec<MessageEnvelope> = raw
            .into_iter()
            .filter_map(|json| match serde_json::from_str(&json) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Skipping unreadable archive entry");
                    None
                }
            })
            .collect();

        debug!(queue = %queue, kind = ?kind, count = result.len(), "Retrieved archived messages");
        Ok(result)
    }

    /// Find one archived message by id.
    pub async fn get(
        &self,
        queue: &QueueName,
        kind: ArchiveKind,
        id: &Uuid,
    ) -> Result<Option<MessageEnvelope>, StoreError> {
        let raw = self.store.lrange(&kind.key(queue), 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|json| serde_json::from_str::<MessageEnvelope>(json).ok())
            .find(|envelope| envelope.id == *id))
    }

    /// Delete the whole archive. Returns whether there was anything to delete.
    pub async fn purge(&self, queue: &QueueName, kind: ArchiveKind) -> Result<bool, StoreError> {
        let key = kind.key(queue);
        if !self.store.exists(&key).await? {
            debug!(queue = %queue, kind = ?kind, "Archive already empty");
            return Ok(false);
        }
        let mut tx = Transaction::new();
        tx.del(&key);
        self.store.commit(tx).await?;
        info!(queue = %queue, kind = ?kind, "Purged message archive");
        Ok(true)
    }
}
