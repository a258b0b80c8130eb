//! Crate-level error used where roles and the supervisor meet.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::gc::GcError;
use crate::keys::KeyError;
use crate::lock::LockError;
use crate::message::MessageError;
use crate::queue::QueueError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Gc(#[from] GcError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("already consuming {0}")]
    DuplicateSubscription(String),

    #[error("role failed: {0}")]
    RoleFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
