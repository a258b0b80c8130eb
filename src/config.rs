//! redq settings: the Redis connection, the key namespace, message defaults,
//! consumer subscriptions and the two background roles.
//!
//! The file comes from `REDQ_CONFIG` (default `config/redq.toml`). Before the
//! TOML is parsed, `${NAME}` placeholders are filled from the environment.
//! Unset names stay as written and are reported once per load.
//!
//! ```toml
//! namespace = "shop"
//!
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [messages.defaults]
//! retry_threshold = 5
//! retry_delay_ms = 0
//!
//! [messages.store.acknowledged]
//! enabled = true
//! queue_size = 1000
//!
//! [[consumer.queues]]
//! name = "orders"
//!
//! [[consumer.queues]]
//! name = "events"
//! group = "billing"
//! ```

use regex::{Captures, Regex};
use serde::Deserialize;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{info, warn};

use crate::keys::{KeyError, KeySchema};
use crate::message::DeliverySettings;

const CONFIG_PATH_VAR: &str = "REDQ_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/redq.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("invalid name: {0}")]
    InvalidName(#[from] KeyError),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct RedqConfig {
    /// Namespace for bare queue names. `global` is reserved.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub logger: LoggerConfig,

    #[serde(default)]
    pub messages: MessagesConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub gc: GcConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for RedqConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            redis: RedisConfig::default(),
            logger: LoggerConfig::default(),
            messages: MessagesConfig::default(),
            consumer: ConsumerConfig::default(),
            gc: GcConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggerConfig {
    /// Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MessagesConfig {
    /// Used when neither the message nor its queue says otherwise.
    #[serde(default)]
    pub defaults: DeliverySettings,

    #[serde(default)]
    pub store: MessageStoreConfig,
}

/// Archives of finished messages.
#[derive(Debug, Deserialize, Clone)]
pub struct MessageStoreConfig {
    #[serde(default = "default_acknowledged_archive")]
    pub acknowledged: ArchiveConfig,

    #[serde(default = "default_dead_letter_archive")]
    pub dead_lettered: ArchiveConfig,
}

impl Default for MessageStoreConfig {
    fn default() -> Self {
        Self {
            acknowledged: default_acknowledged_archive(),
            dead_lettered: default_dead_letter_archive(),
        }
    }
}

fn default_acknowledged_archive() -> ArchiveConfig {
    ArchiveConfig {
        enabled: false,
        ..ArchiveConfig::default()
    }
}

fn default_dead_letter_archive() -> ArchiveConfig {
    ArchiveConfig::default()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Newest entries kept per queue; 0 keeps everything.
    #[serde(default)]
    pub queue_size: u64,

    /// Expiry of the whole archive after its last write; 0 never expires.
    #[serde(default)]
    pub expire_ms: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_size: 0,
            expire_ms: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Consumer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Queues the worker binary consumes.
    #[serde(default)]
    pub queues: Vec<SubscriptionConfig>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            queues: Vec::new(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// `name` or `name@namespace`.
    pub name: String,

    /// Required for pub/sub queues.
    #[serde(default)]
    pub group: Option<String>,

    /// Name of the registered handler that processes the messages.
    #[serde(default = "default_handler")]
    pub handler: String,
}

fn default_handler() -> String {
    "log".to_string()
}

/// Garbage collector configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GcConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_gc_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_gc_interval_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
        }
    }
}

fn default_gc_interval_ms() -> u64 {
    5000
}

fn default_lock_ttl_ms() -> u64 {
    10000
}

/// Scheduler configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_scheduler_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// Due entries handled per queue and tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_scheduler_interval_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_scheduler_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    100
}

impl RedqConfig {
    /// Reads the file named by `REDQ_CONFIG`, or `config/redq.toml`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var_os(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(path)
    }

    /// A file that does not exist yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No config file, running with defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config = Self::parse(&raw)?;
        info!(
            path = %path.display(),
            namespace = %config.namespace,
            queues = config.consumer.queues.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Fills `${NAME}` placeholders from the environment, then parses and
    /// validates.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let (expanded, unset) = expand_placeholders(raw);
        if !unset.is_empty() {
            warn!(vars = ?unset, "Environment variables not set, placeholders kept");
        }
        let config: Self = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Key schema for the configured namespace.
    pub fn key_schema(&self) -> Result<KeySchema, ConfigError> {
        Ok(KeySchema::new(&self.namespace)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.redis.url;
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(invalid("redis.url", "expected a redis:// or rediss:// URL"));
        }
        if self.redis.pool_size == 0 {
            return Err(invalid("redis.pool_size", "must be at least 1"));
        }

        for (key, value) in [
            ("consumer.heartbeat_interval_ms", self.consumer.heartbeat_interval_ms),
            ("gc.interval_ms", self.gc.interval_ms),
            ("scheduler.interval_ms", self.scheduler.interval_ms),
            ("scheduler.batch_size", self.scheduler.batch_size as u64),
        ] {
            if value == 0 {
                return Err(invalid(key, "must be greater than 0"));
            }
        }

        if self.gc.lock_ttl_ms < 2 * self.gc.interval_ms {
            warn!(
                lock_ttl_ms = self.gc.lock_ttl_ms,
                interval_ms = self.gc.interval_ms,
                "GC lock TTL is shorter than two ticks, the lock may change hands between ticks"
            );
        }

        let schema = self.key_schema()?;
        for subscription in &self.consumer.queues {
            schema.queue(&subscription.name)?;
            if let Some(group) = &subscription.group {
                crate::keys::validate_name(group)?;
            }
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is a valid regex")
    })
}

/// Returns the expanded text and the names that had no value.
fn expand_placeholders(raw: &str) -> (String, Vec<String>) {
    let mut unset = Vec::new();
    let expanded = placeholder()
        .replace_all(raw, |caps: &Captures| match env::var(&caps[1]) {
            Ok(value) => value,
            Err(_) => {
                unset.push(caps[1].to_string());
                caps[0].to_string()
            }
        })
        .into_owned();
    (expanded, unset)
}
