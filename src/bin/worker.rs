//! redq Worker - Queue Consumer Process
//!
//! Consumes the queues listed under `[[consumer.queues]]` in the config file
//! and hands every message to the handler named in its entry. The process
//! also takes part in garbage collection and scheduling unless those are
//! disabled.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REDQ_CONFIG`: Config file path (default: "config/redq.toml")
//! - `RUST_LOG`: Logging level, overrides `[logger] level`

use std::sync::Arc;
use tracing::{error, info, warn};

use redq::config::RedqConfig;
use redq::handler::HandlerRegistry;
use redq::logging::init_tracing;
use redq::{Broker, BrokerConfig, Consumer, ConsumerOptions, RedisStore, ShutdownSignal, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = RedqConfig::load()?;
    init_tracing(&config.logger.level);

    info!(
        namespace = %config.namespace,
        queues = config.consumer.queues.len(),
        "redq worker starting"
    );

    let store: Arc<dyn Store> = Arc::new(RedisStore::connect(
        &config.redis.url,
        config.redis.pool_size,
    )?);
    let broker = Broker::new(store, config.key_schema()?, BrokerConfig::from(&config));

    let handlers = HandlerRegistry::default();
    let mut consumer = Consumer::new(broker, ConsumerOptions::from(&config));
    for subscription in &config.consumer.queues {
        let Some(handler) = handlers.get(&subscription.handler) else {
            error!(
                handler = %subscription.handler,
                available = ?handlers.list(),
                "Unknown handler"
            );
            return Err(format!("unknown handler '{}'", subscription.handler).into());
        };
        consumer.consume(&subscription.name, subscription.group.as_deref(), handler)?;
    }
    if config.consumer.queues.is_empty() {
        warn!("No queues configured, running GC and scheduler only");
    }

    // Setup graceful shutdown
    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait().await });

    match consumer.run(shutdown).await {
        Ok(()) => {
            info!("Worker shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Worker stopped with an error");
            Err(e.into())
        }
    }
}
