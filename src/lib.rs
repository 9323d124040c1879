//! product-events - event broker client for the product service
//!
//! Publishes product events on a shared topic exchange and consumes events
//! from peer services through a durable, acknowledged subscription. The
//! connection is supervised: on loss it is re-established and every recorded
//! subscription is rebound without caller involvement.
//!
//! ```ignore
//! let config = Config::load(None)?;
//! let broker = MessageBroker::amqp(config.broker)?;
//! broker.connect().await?;
//! broker.subscribe(EventCatalog::default_subscriptions(), PeerEventLogger::new()).await?;
//! broker.publish_json(catalog::PRODUCT_CREATED, &product).await?;
//! ```

pub mod broker;
pub mod bus;
pub mod catalog;
pub mod config;
pub mod envelope;
pub mod reactions;
pub mod transport;
pub mod utils;

pub use broker::{BrokerHealth, MessageBroker};
pub use bus::{
    ConnectionError, ConnectionState, EventHandler, HandlerError, HandlerResult, PublishError,
    SubscribeError,
};
pub use catalog::EventCatalog;
pub use config::{BrokerConfig, Config, ConfigError, HandlerFailurePolicy};
pub use envelope::{EventData, EventEnvelope, MessageDecodeError, ReceivedEvent};
pub use reactions::PeerEventLogger;
