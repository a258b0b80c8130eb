//! Token-owned, TTL'd mutual exclusion over the store.
//!
//! A lock is a string key holding a random token. Only the holder whose token
//! is stored may extend or release it; anything else means the lock expired
//! and may belong to someone else now.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{ScriptCall, ScriptName, Store, StoreError};

/// Polling interval while waiting for a contended lock.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Lock errors
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock '{0}' is held elsewhere")]
    AcquireError(String),

    #[error("lock '{0}' was lost")]
    ExtendError(String),

    #[error("lock is not held")]
    NotHeld,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
struct Held {
    key: String,
    token: String,
    ttl: Duration,
}

struct Inner {
    store: Arc<dyn Store>,
    held: Mutex<Option<Held>>,
    locked: AtomicBool,
}

impl Inner {
    fn held(&self) -> Option<Held> {
        self.held.lock().ok().and_then(|h| h.clone())
    }

    fn set_held(&self, held: Option<Held>) {
        self.locked.store(held.is_some(), Ordering::SeqCst);
        if let Ok(mut slot) = self.held.lock() {
            *slot = held;
        }
    }

    async fn extend(&self, ttl: Duration) -> Result<(), LockError> {
        let Some(held) = self.held() else {
            return Err(LockError::NotHeld);
        };

        let reply = self
            .store
            .eval(
                ScriptCall::new(ScriptName::ExtendLock)
                    .key(&held.key)
                    .arg(&held.token)
                    .arg(ttl.as_millis()),
            )
            .await?;

        if reply.is_truthy() {
            self.set_held(Some(Held { ttl, ..held }));
            Ok(())
        } else {
            warn!(lock = %held.key, "Lock lost");
            self.set_held(None);
            Err(LockError::ExtendError(held.key))
        }
    }
}

/// One holder of at most one lock at a time.
pub struct LockManager {
    inner: Arc<Inner>,
    auto_extend: bool,
    extender: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                held: Mutex::new(None),
                locked: AtomicBool::new(false),
            }),
            auto_extend: false,
            extender: Mutex::new(None),
        }
    }

    /// Keep the lock alive in the background, extending it every `ttl / 2`.
    /// If an extension fails the background task stops and
    /// [`is_locked`](Self::is_locked) turns false.
    pub fn with_auto_extend(mut self) -> Self {
        self.auto_extend = true;
        self
    }

    /// Acquire `key` for `ttl`.
    ///
    /// Acquiring the key this manager already holds extends it instead. With
    /// `retry_on_fail` the call polls until the lock is free; drop the future
    /// to give up.
    pub async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        retry_on_fail: bool,
    ) -> Result<(), LockError> {
        if let Some(held) = self.inner.held() {
            if held.key == key {
                return self.extend_lock(ttl).await;
            }
            self.release_lock().await?;
        }

        let token = Uuid::new_v4().to_string();
        let ttl_ms = ttl.as_millis() as u64;
        loop {
            if self.inner.store.set_nx_px(key, &token, ttl_ms).await? {
                debug!(lock = %key, ttl_ms = ttl_ms, "Lock acquired");
                self.inner.set_held(Some(Held {
                    key: key.to_string(),
                    token,
                    ttl,
                }));
                if self.auto_extend {
                    self.start_extender(ttl);
                }
                return Ok(());
            }
            if !retry_on_fail {
                return Err(LockError::AcquireError(key.to_string()));
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Push the expiry of the held lock out to `ttl` from now.
    pub async fn extend_lock(&self, ttl: Duration) -> Result<(), LockError> {
        self.inner.extend(ttl).await
    }

    /// Release the lock if this manager holds it. Releasing an unheld lock
    /// does nothing.
    pub async fn release_lock(&self) -> Result<(), LockError> {
        self.stop_extender();
        let Some(held) = self.inner.held() else {
            return Ok(());
        };
        self.inner.set_held(None);

        let reply = self
            .inner
            .store
            .eval(
                ScriptCall::new(ScriptName::ReleaseLock)
                    .key(&held.key)
                    .arg(&held.token),
            )
            .await?;
        if reply.is_truthy() {
            debug!(lock = %held.key, "Lock released");
        } else {
            debug!(lock = %held.key, "Lock had already expired");
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::SeqCst)
    }

    /// Key of the held lock.
    pub fn key(&self) -> Option<String> {
        self.inner.held().map(|h| h.key)
    }

    fn start_extender(&self, ttl: Duration) {
        self.stop_extender();
        let inner = self.inner.clone();
        let period = (ttl / 2).max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let ttl = inner.held().map(|h| h.ttl).unwrap_or(ttl);
                if inner.extend(ttl).await.is_err() {
                    break;
                }
            }
        });
        if let Ok(mut slot) = self.extender.lock() {
            *slot = Some(handle);
        }
    }

    fn stop_extender(&self) {
        if let Some(handle) = self.extender.lock().ok().and_then(|mut h| h.take()) {
            handle.abort();
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.stop_extender();
    }
}
