//! product-events: broker client for the product service
//!
//! Connects to RabbitMQ, subscribes to customer and order events from peer
//! services and logs them until interrupted.
//!
//! ## Configuration
//! - PRODUCT_EVENTS_CONFIG: YAML config file (optional; also the first argument)
//! - PRODUCT_EVENTS__BROKER__*: per-field overrides, e.g. `__PREFETCH=20`
//! - RABBITMQ_URL: broker URL
//! - PRODUCT_EVENTS_LOG: log filter (default: info)
//!
//! A broker that stays unreachable through every connection attempt is not
//! fatal: the process keeps running with the broker reported disconnected.

use tracing::{info, warn};

use product_events::utils::bootstrap::init_tracing;
use product_events::{Config, EventCatalog, MessageBroker, PeerEventLogger};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    let broker = MessageBroker::amqp(config.broker)?;

    info!(
        service = %broker.config().service_name,
        exchange = %broker.config().exchange_name(),
        "product-events starting"
    );

    match broker.connect().await {
        Ok(()) => {
            broker
                .subscribe(EventCatalog::default_subscriptions(), PeerEventLogger::new())
                .await?;
            info!(
                patterns = ?EventCatalog::default_subscriptions(),
                "Listening for peer events"
            );
        }
        Err(e) => {
            warn!(error = %e, "Message broker unavailable, continuing without it");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!(health = ?broker.health(), "Shutting down");
    broker.close().await;

    Ok(())
}
