//! Durable subscriptions and the receive loop.
//!
//! Every subscription shares the service queue `<service>.events`. Each
//! `subscribe` call binds its patterns to that queue and starts one consumer;
//! a message matched by several bindings still lands in the queue once.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::routing::validate_pattern;
use super::{ConnectionManager, EventHandler, HandlerError, SubscribeError};
use crate::config::{BrokerConfig, HandlerFailurePolicy};
use crate::envelope::ReceivedEvent;
use crate::transport::{Delivery, DeliveryStream, Session, TransportError};

/// A recorded subscription, replayed after every reconnection.
pub(crate) struct Registration {
    pub(crate) patterns: Vec<String>,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) consumer_tag: String,
}

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded; message acknowledged.
    Handled,
    /// Body could not be decoded; message acknowledged.
    Undecodable,
    /// Handler failed or panicked; settled per the policy.
    HandlerFailed(HandlerFailurePolicy),
}

/// Binds the service queue and dispatches inbound events to handlers.
#[derive(Clone)]
pub struct EventSubscriber {
    manager: ConnectionManager,
}

impl EventSubscriber {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Subscribe `handler` to every routing key matching any of `patterns`.
    ///
    /// The subscription is recorded and restored automatically after a
    /// reconnection.
    pub async fn subscribe<I, S, H>(&self, patterns: I, handler: H) -> Result<(), SubscribeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        H: EventHandler + 'static,
    {
        self.subscribe_shared(patterns, Arc::new(handler)).await
    }

    /// Like [`subscribe`](Self::subscribe) for a handler that is already shared.
    pub async fn subscribe_shared<I, S>(
        &self,
        patterns: I,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscribeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = normalize_patterns(patterns)?;
        self.manager.register(patterns, handler).await
    }
}

/// Validate patterns and drop duplicates, keeping first-seen order.
fn normalize_patterns<I, S>(patterns: I) -> Result<Vec<String>, SubscribeError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        validate_pattern(pattern).map_err(|reason| SubscribeError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        })?;
        if !out.iter().any(|p| p == pattern) {
            out.push(pattern.to_string());
        }
    }

    if out.is_empty() {
        return Err(SubscribeError::NoPatterns);
    }
    Ok(out)
}

impl SubscribeError {
    /// The transport failure behind a topology error, for replay on reconnect.
    pub(crate) fn into_transport(self) -> TransportError {
        match self {
            SubscribeError::DeclareQueue { source, .. }
            | SubscribeError::Bind { source, .. }
            | SubscribeError::Consume(source) => source,
            SubscribeError::ConnectionClosed | SubscribeError::NotConnected => {
                TransportError::Closed
            }
            other => TransportError::Channel(other.to_string()),
        }
    }
}

/// Declare the service queue, bind the registration's patterns and start its
/// receive loop on `session`.
pub(crate) async fn activate(
    session: &Arc<dyn Session>,
    config: &BrokerConfig,
    registration: &Registration,
) -> Result<JoinHandle<()>, SubscribeError> {
    let queue = config.queue_name();
    let exchange = config.exchange_name();

    session
        .declare_queue(&queue, &config.queue_spec())
        .await
        .map_err(|source| SubscribeError::DeclareQueue {
            queue: queue.clone(),
            source,
        })?;

    for pattern in &registration.patterns {
        session
            .bind_queue(&queue, &exchange, pattern)
            .await
            .map_err(|source| SubscribeError::Bind {
                pattern: pattern.clone(),
                source,
            })?;
        info!(queue = %queue, exchange = %exchange, pattern = %pattern, "Bound queue");
    }

    let deliveries = session
        .consume(&queue, &registration.consumer_tag)
        .await
        .map_err(SubscribeError::Consume)?;

    Ok(tokio::spawn(receive_loop(
        deliveries,
        registration.handler.clone(),
        config.failure_policy,
        queue,
    )))
}

async fn receive_loop(
    mut deliveries: DeliveryStream,
    handler: Arc<dyn EventHandler>,
    policy: HandlerFailurePolicy,
    queue: String,
) {
    debug!(queue = %queue, "Receive loop started");
    while let Some(next) = deliveries.next().await {
        match next {
            Ok(delivery) => {
                process_delivery(delivery, handler.as_ref(), policy).await;
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "Delivery stream failed");
                break;
            }
        }
    }
    debug!(queue = %queue, "Receive loop ended");
}

/// Decode one delivery, run the handler and settle the message.
///
/// Never fails: decode errors, handler errors and handler panics are logged
/// and the message is settled on every path.
pub async fn process_delivery(
    delivery: Delivery,
    handler: &dyn EventHandler,
    policy: HandlerFailurePolicy,
) -> DeliveryOutcome {
    let span = info_span!(
        "bus.consume",
        routing_key = %delivery.routing_key,
        redelivered = delivery.redelivered,
    );

    async {
        let event = match ReceivedEvent::decode(
            &delivery.body,
            delivery.routing_key.clone(),
            delivery.redelivered,
            delivery.properties.message_id.as_deref(),
        ) {
            Ok(event) => Arc::new(event),
            Err(e) => {
                warn!(error = %e, "Discarding undecodable message");
                settle(&delivery, SettleAction::Ack).await;
                return DeliveryOutcome::Undecodable;
            }
        };

        debug!(
            event_type = %event.event_type,
            event_id = event.event_id.as_deref().unwrap_or("-"),
            source = event.service.as_deref().unwrap_or("unknown"),
            description = event.description().unwrap_or("uncatalogued"),
            "Received event"
        );

        let event_type = event.event_type.clone();
        let result = AssertUnwindSafe(async { handler.handle(event).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_error(panic)));

        match result {
            Ok(()) => {
                settle(&delivery, SettleAction::Ack).await;
                DeliveryOutcome::Handled
            }
            Err(e) => {
                let action = match policy {
                    HandlerFailurePolicy::Acknowledge => SettleAction::Ack,
                    HandlerFailurePolicy::Requeue => SettleAction::Reject { requeue: true },
                    HandlerFailurePolicy::DeadLetter => SettleAction::Reject { requeue: false },
                };
                warn!(
                    event_type = %event_type,
                    error = %e,
                    policy = ?policy,
                    "Event handler failed"
                );
                settle(&delivery, action).await;
                DeliveryOutcome::HandlerFailed(policy)
            }
        }
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, Copy)]
enum SettleAction {
    Ack,
    Reject { requeue: bool },
}

async fn settle(delivery: &Delivery, action: SettleAction) {
    let result = match action {
        SettleAction::Ack => delivery.ack().await,
        SettleAction::Reject { requeue } => delivery.reject(requeue).await,
    };
    if let Err(e) = result {
        // Unsettled messages are redelivered by the broker once the
        // connection is re-established.
        error!(action = ?action, error = %e, "Failed to settle delivery");
    }
}

fn panic_error(panic: Box<dyn std::any::Any + Send>) -> HandlerError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {}", message).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ExchangeKind, InMemoryBroker, QueueSpec, Transport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const EXCHANGE: &str = "payetonkawa.events";
    const QUEUE: &str = "product-api.events";

    async fn one_delivery(broker: &InMemoryBroker, body: &[u8]) -> (Arc<dyn Session>, Delivery) {
        let session = broker.connect().await.unwrap();
        session
            .declare_exchange(EXCHANGE, ExchangeKind::Topic)
            .await
            .unwrap();
        session
            .declare_queue(QUEUE, &QueueSpec::durable())
            .await
            .unwrap();
        session.bind_queue(QUEUE, EXCHANGE, "#").await.unwrap();
        let mut deliveries = session.consume(QUEUE, "test").await.unwrap();
        broker.inject(EXCHANGE, "order.created", body.to_vec()).unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        (session, delivery)
    }

    fn counting_handler(calls: Arc<AtomicUsize>) -> impl EventHandler {
        move |_event: Arc<ReceivedEvent>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn failing_handler() -> impl EventHandler {
        |_event: Arc<ReceivedEvent>| async { Err::<(), HandlerError>("boom".into()) }
    }

    #[test]
    fn test_normalize_patterns_dedupes_in_order() {
        let patterns = normalize_patterns(["order.*", "customer.created", "order.*"]).unwrap();
        assert_eq!(patterns, vec!["order.*", "customer.created"]);
    }

    #[test]
    fn test_normalize_patterns_rejects_empty_and_invalid() {
        assert!(matches!(
            normalize_patterns(Vec::<String>::new()),
            Err(SubscribeError::NoPatterns)
        ));
        assert!(matches!(
            normalize_patterns(["order..created"]),
            Err(SubscribeError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn test_handled_message_is_acked() {
        let broker = InMemoryBroker::new();
        let (_session, delivery) =
            one_delivery(&broker, br#"{"event_type":"order.created","data":{"order_id":1}}"#)
                .await;
        let calls = Arc::new(AtomicUsize::new(0));

        let outcome = process_delivery(
            delivery,
            &counting_handler(calls.clone()),
            HandlerFailurePolicy::Acknowledge,
        )
        .await;

        assert_eq!(outcome, DeliveryOutcome::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.unacked_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_acked_without_handler() {
        let broker = InMemoryBroker::new();
        let (_session, delivery) = one_delivery(&broker, b"not json").await;
        let calls = Arc::new(AtomicUsize::new(0));

        let outcome = process_delivery(
            delivery,
            &counting_handler(calls.clone()),
            HandlerFailurePolicy::Requeue,
        )
        .await;

        assert_eq!(outcome, DeliveryOutcome::Undecodable);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert_eq!(broker.ready_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_failure_with_acknowledge_policy_drops() {
        let broker = InMemoryBroker::new();
        let (_session, delivery) = one_delivery(&broker, br#"{"event_type":"order.created"}"#).await;

        let outcome =
            process_delivery(delivery, &failing_handler(), HandlerFailurePolicy::Acknowledge)
                .await;

        assert_eq!(
            outcome,
            DeliveryOutcome::HandlerFailed(HandlerFailurePolicy::Acknowledge)
        );
        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert_eq!(broker.ready_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_failure_with_requeue_policy_requeues() {
        let broker = InMemoryBroker::new();
        let (_session, delivery) = one_delivery(&broker, br#"{"event_type":"order.created"}"#).await;

        process_delivery(delivery, &failing_handler(), HandlerFailurePolicy::Requeue).await;

        // The test consumer is gone, so the message waits in the queue.
        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert_eq!(broker.ready_count(QUEUE), 1);
    }

    #[tokio::test]
    async fn test_handler_panic_counts_as_failure() {
        let broker = InMemoryBroker::new();
        let (_session, delivery) = one_delivery(&broker, br#"{"event_type":"order.created"}"#).await;
        let handler = |_event: Arc<ReceivedEvent>| async {
            if true {
                panic!("handler bug");
            }
            Ok::<(), HandlerError>(())
        };

        let outcome =
            process_delivery(delivery, &handler, HandlerFailurePolicy::Acknowledge).await;

        assert_eq!(
            outcome,
            DeliveryOutcome::HandlerFailed(HandlerFailurePolicy::Acknowledge)
        );
        assert_eq!(broker.unacked_count(QUEUE), 0);
    }

    #[test]
    fn test_topology_errors_expose_transport_cause() {
        let err = SubscribeError::Bind {
            pattern: "order.*".into(),
            source: TransportError::Closed,
        };
        assert_eq!(err.into_transport(), TransportError::Closed);
        assert_eq!(
            SubscribeError::NoPatterns.into_transport(),
            TransportError::Channel("At least one binding pattern is required".into())
        );
    }
}
