//! Event broker client.
//!
//! This module contains:
//! - `ConnectionManager`: owns the session, retries, reconnects and replays
//!   subscriptions
//! - `EventPublisher`: emits event envelopes on the shared exchange
//! - `EventSubscriber`: binds the service queue and drives receive loops
//! - `EventHandler` trait: caller-supplied processing of received events
//! - Error types for each of the above

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::envelope::ReceivedEvent;
use crate::transport::TransportError;

pub mod connection;
pub mod publisher;
pub mod routing;
pub mod subscriber;

pub use connection::{ConnectionManager, ConnectionState};
pub use publisher::EventPublisher;
pub use subscriber::{DeliveryOutcome, EventSubscriber};

// ============================================================================
// Errors
// ============================================================================

/// Errors establishing the broker connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Could not connect after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: TransportError,
    },

    #[error("Broker client has been closed")]
    Closed,
}

/// Errors publishing an event. None of these are retried.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Connection closed while publishing")]
    ConnectionClosed,

    /// Empty, or longer than an AMQP short string. Nothing else is checked.
    #[error("Invalid event type '{event_type}': {reason}")]
    InvalidEventType { event_type: String, reason: String },

    #[error("Event payload must serialize to a JSON object")]
    PayloadNotObject,

    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for PublishError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => PublishError::ConnectionClosed,
            other => PublishError::Transport(other),
        }
    }
}

/// Errors registering a subscription.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Connection closed while subscribing")]
    ConnectionClosed,

    #[error("At least one binding pattern is required")]
    NoPatterns,

    #[error("Invalid binding pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Failed to declare queue '{queue}': {source}")]
    DeclareQueue {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to bind pattern '{pattern}': {source}")]
    Bind {
        pattern: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to start consumer: {0}")]
    Consume(#[source] TransportError),
}

// ============================================================================
// Handlers
// ============================================================================

/// Error returned by an event handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of handling one event.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Handler for events received from the bus.
///
/// Closures taking an `Arc<ReceivedEvent>` and returning a future implement
/// this trait directly.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: Arc<ReceivedEvent>) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<ReceivedEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, event: Arc<ReceivedEvent>) -> BoxFuture<'static, HandlerResult> {
        self(event).boxed()
    }
}
