//! Activation of due scheduled and delayed messages.
//!
//! Any number of consumers may run a scheduler; a short store lock makes
//! sure only one of them works per tick. Each tick walks every queue's
//! scheduled and delayed sets and moves entries whose time has come to
//! pending. A periodic message gets its next occurrence parked in the same
//! atomic step that activates the current one.

use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::broker::{Broker, BrokerError};
use crate::config::SchedulerConfig;
use crate::error::Error;
use crate::keys::{KeySchema, QueueName};
use crate::lock::{LockError, LockManager};
use crate::message::{now_ms, schedule, MessageEnvelope};
use crate::queue::QueueManager;
use crate::store::{StoreError, Transaction};
use crate::supervisor::ShutdownListener;

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerTick {
    /// Another process held the scheduler lock.
    Skipped,
    Ran { activated: usize, dropped: usize },
}

pub struct Scheduler {
    broker: Broker,
    queues: QueueManager,
    lock: LockManager,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(broker: Broker, config: SchedulerConfig) -> Self {
        let store = broker.store().clone();
        Self {
            queues: QueueManager::new(store.clone()),
            lock: LockManager::new(store),
            broker,
            config,
        }
    }

    pub fn lock_key() -> String {
        KeySchema::lock("scheduler")
    }

    pub async fn tick(&self) -> Result<SchedulerTick, Error> {
        self.tick_at(now_ms()).await
    }

    /// Activate everything due at `now`.
    pub async fn tick_at(&self, now: i64) -> Result<SchedulerTick, Error> {
        let ttl = Duration::from_millis(self.config.lock_ttl_ms);
        match self.lock.acquire_lock(&Self::lock_key(), ttl, false).await {
            Ok(()) => {}
            Err(LockError::AcquireError(_)) => {
                debug!("Scheduler lock held elsewhere, skipping tick");
                return Ok(SchedulerTick::Skipped);
            }
            Err(e) => return Err(e.into()),
        }

        let result = self.activate_due(now).await;
        self.lock.release_lock().await?;
        result
    }

    async fn activate_due(&self, now: i64) -> Result<SchedulerTick, Error> {
        let mut activated = 0;
        let mut dropped = 0;
        for queue in self.queues.list().await? {
            for (source, periodic) in [(queue.scheduled(), true), (queue.delayed(), false)] {
                let due = self
                    .broker
                    .store()
                    .zrange_by_score(&source, now as f64, self.config.batch_size)
                    .await?;
                for id in due {
                    match self.activate_one(&queue, &source, &id, periodic, now).await? {
                        true => activated += 1,
                        false => dropped += 1,
                    }
                }
            }
        }
        if activated > 0 || dropped > 0 {
            info!(activated = activated, dropped = dropped, "Scheduler tick");
        }
        Ok(SchedulerTick::Ran { activated, dropped })
    }

    /// Returns false when the entry was dropped or already gone.
    async fn activate_one(
        &self,
        queue: &QueueName,
        source: &str,
        id: &str,
        periodic: bool,
        now: i64,
    ) -> Result<bool, Error> {
        let envelope = match uuid::Uuid::parse_str(id) {
            Ok(uuid) => match self.broker.load(queue, &uuid).await {
                Ok(envelope) => envelope,
                Err(BrokerError::Store(StoreError::SerializationError(e))) => {
                    warn!(queue = %queue, id = %id, error = %e, "Dropping unreadable message");
                    None
                }
                Err(e) => return Err(e.into()),
            },
            Err(_) => None,
        };

        let Some(envelope) = envelope else {
            warn!(queue = %queue, id = %id, "Dropping orphaned schedule entry");
            let mut tx = Transaction::new();
            tx.zrem(source, id);
            if let Ok(uuid) = uuid::Uuid::parse_str(id) {
                tx.del(queue.message(&uuid));
            }
            self.broker.store().commit(tx).await?;
            return Ok(false);
        };

        let next = if periodic && envelope.is_periodic() {
            next_occurrence(&envelope, now)
        } else {
            None
        };
        Ok(self.broker.activate(source, &envelope, next.as_ref()).await?)
    }

    #[instrument(skip_all, name = "scheduler")]
    pub async fn run(self, mut shutdown: ShutdownListener) -> Result<(), Error> {
        info!(interval_ms = self.config.interval_ms, "Scheduler started");
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }

        self.lock.release_lock().await?;
        info!("Scheduler stopped");
        Ok(())
    }
}

/// The instance following `envelope`, or `None` when its schedule is done.
fn next_occurrence(envelope: &MessageEnvelope, now: i64) -> Option<MessageEnvelope> {
    let mut progress = envelope.state.clone();
    match schedule::next_occurrence(&envelope.message.schedule, &mut progress, now) {
        Ok(Some(fire_at)) => Some(envelope.next_occurrence(&progress, fire_at)),
        Ok(None) => {
            debug!(message_id = %envelope.id, "Periodic message exhausted");
            None
        }
        Err(e) => {
            warn!(message_id = %envelope.id, error = %e, "Cannot compute next occurrence");
            None
        }
    }
}
