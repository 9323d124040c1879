//! Transport seam between the broker client and the wire.
//!
//! A [`Transport`] opens [`Session`]s. A session is one broker connection
//! with one channel on it; everything the broker client does goes through
//! the session it currently holds.
//!
//! Implementations:
//! - `AmqpTransport`: RabbitMQ via lapin (feature `amqp`)
//! - `InMemoryBroker`: in-process topic broker for tests and local runs

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use memory::{Binding, InMemoryBroker, PublishedMessage};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by the wire layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Channel operation failed: {0}")]
    Channel(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection closed")]
    Closed,
}

/// Exchange types used by the broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Fanout,
}

/// Queue declaration arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    pub durable: bool,
    pub exclusive: bool,
    /// Exchange that rejected (non-requeued) messages are rerouted to.
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    /// Durable, shared queue.
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            dead_letter_exchange: None,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// Message properties carried alongside the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    /// Delivery mode 2 when set.
    pub persistent: bool,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    pub app_id: Option<String>,
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Reject the delivery. With `requeue` false the broker drops it, or
    /// dead-letters it when the queue has a dead-letter exchange.
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer.
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        properties: MessageProperties,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            properties,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer. Ends when the session goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Opens sessions to a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Session>>;
}

/// One live connection plus channel.
///
/// Exchanges and queues are always declared durable.
#[async_trait]
pub trait Session: Send + Sync {
    /// Bound the number of unacknowledged deliveries per consumer.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    async fn declare_queue(&self, name: &str, spec: &QueueSpec) -> Result<()>;

    /// Bind a queue to an exchange. Binding the same triple twice is a no-op.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Whether the connection and channel are still usable.
    fn is_open(&self) -> bool;

    /// Resolves once the connection has been lost.
    async fn closed(&self);

    async fn close(&self) -> Result<()>;
}
