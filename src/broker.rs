//! Broker client facade for the application root.
//!
//! [`MessageBroker`] bundles the connection manager, publisher and subscriber
//! behind one cheaply cloneable handle. Construct it once at startup and pass
//! clones to whatever needs to publish or subscribe.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::bus::{
    ConnectionError, ConnectionManager, ConnectionState, EventHandler, EventPublisher,
    EventSubscriber, PublishError, SubscribeError,
};
use crate::config::{BrokerConfig, ConfigError};
use crate::envelope::{EventData, EventEnvelope};
use crate::transport::Transport;

/// Health snapshot for the service's health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerHealth {
    pub status: &'static str,
    pub service: String,
    /// `connected` or `disconnected`.
    pub message_broker: &'static str,
}

/// The broker client.
#[derive(Clone)]
pub struct MessageBroker {
    manager: ConnectionManager,
    publisher: EventPublisher,
    subscriber: EventSubscriber,
}

impl MessageBroker {
    /// Build a client over `transport`. Does not connect.
    pub fn new(config: BrokerConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate().map_err(ConfigError::Invalid)?;
        let manager = ConnectionManager::new(config, transport);
        Ok(Self {
            publisher: EventPublisher::new(manager.clone()),
            subscriber: EventSubscriber::new(manager.clone()),
            manager,
        })
    }

    /// Build a client that talks to RabbitMQ at `config.url`.
    #[cfg(feature = "amqp")]
    pub fn amqp(config: BrokerConfig) -> Result<Self, ConfigError> {
        let transport = crate::transport::AmqpTransport::new(
            config.url.clone(),
            config.heartbeat(),
            config.connection_timeout(),
        );
        Self::new(config, Arc::new(transport))
    }

    /// Connect with the configured attempts and base delay.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.manager.connect().await
    }

    pub async fn connect_with(
        &self,
        max_attempts: usize,
        base_delay: Duration,
    ) -> Result<(), ConnectionError> {
        self.manager.connect_with(max_attempts, base_delay).await
    }

    pub async fn publish(
        &self,
        event_type: &str,
        data: EventData,
    ) -> Result<EventEnvelope, PublishError> {
        self.publisher.publish(event_type, data).await
    }

    pub async fn publish_json<T>(
        &self,
        event_type: &str,
        payload: &T,
    ) -> Result<EventEnvelope, PublishError>
    where
        T: Serialize + ?Sized,
    {
        self.publisher.publish_json(event_type, payload).await
    }

    /// Publish, logging instead of failing.
    pub async fn publish_or_log(&self, event_type: &str, data: EventData) -> bool {
        self.publisher.publish_or_log(event_type, data).await
    }

    pub async fn subscribe<I, S, H>(&self, patterns: I, handler: H) -> Result<(), SubscribeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        H: EventHandler + 'static,
    {
        self.subscriber.subscribe(patterns, handler).await
    }

    pub async fn subscribe_shared<I, S>(
        &self,
        patterns: I,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscribeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.subscriber.subscribe_shared(patterns, handler).await
    }

    pub async fn close(&self) {
        self.manager.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.watch_state()
    }

    pub fn health(&self) -> BrokerHealth {
        BrokerHealth {
            status: "healthy",
            service: self.manager.config().service_name.clone(),
            message_broker: if self.is_connected() {
                "connected"
            } else {
                "disconnected"
            },
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        self.manager.config()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn subscriber(&self) -> &EventSubscriber {
        &self.subscriber
    }
}
