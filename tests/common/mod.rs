//! Shared helpers for broker client integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use product_events::bus::{EventHandler, HandlerResult};
use product_events::transport::InMemoryBroker;
use product_events::{BrokerConfig, MessageBroker, ReceivedEvent};
use serde_json::Value;
use tokio::sync::mpsc;

pub const EXCHANGE: &str = "payetonkawa.events";
pub const QUEUE: &str = "product-api.events";
pub const DEAD_LETTER_QUEUE: &str = "product-api.events.dlq";

const WAIT: Duration = Duration::from_secs(5);

/// Broker config with short retry delays.
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 100,
        ..Default::default()
    }
}

/// A client wired to a fresh in-process broker. Not connected.
pub fn memory_client(config: BrokerConfig) -> (InMemoryBroker, MessageBroker) {
    let broker = InMemoryBroker::new();
    let client = MessageBroker::new(config, Arc::new(broker.clone())).expect("valid config");
    (broker, client)
}

/// A connected client wired to a fresh in-process broker.
pub async fn connected_client() -> (InMemoryBroker, MessageBroker) {
    let (broker, client) = memory_client(test_config());
    client.connect().await.expect("connect to in-memory broker");
    (broker, client)
}

/// Body of an event as a peer service would publish it.
pub fn peer_event(event_type: &str, service: &str, data: Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "event_type": event_type,
        "event_id": uuid::Uuid::new_v4().to_string(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": service,
        "data": data,
    }))
    .expect("serialize peer event")
}

/// Handler that forwards every event to a channel.
pub struct RecordingHandler {
    calls: Arc<AtomicUsize>,
    tx: mpsc::UnboundedSender<Arc<ReceivedEvent>>,
}

pub fn recording_handler() -> (RecordingHandler, mpsc::UnboundedReceiver<Arc<ReceivedEvent>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        RecordingHandler {
            calls: Arc::new(AtomicUsize::new(0)),
            tx,
        },
        rx,
    )
}

impl RecordingHandler {
    /// Another handler feeding the same channel.
    pub fn share(&self) -> Self {
        Self {
            calls: self.calls.clone(),
            tx: self.tx.clone(),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, event: Arc<ReceivedEvent>) -> BoxFuture<'static, HandlerResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(event);
        futures::future::ready(Ok(())).boxed()
    }
}

/// Handler that fails on the listed call numbers (1-based) and records the
/// rest.
pub struct FailingOn {
    failures: Vec<usize>,
    calls: AtomicUsize,
    tx: mpsc::UnboundedSender<(usize, Arc<ReceivedEvent>)>,
}

pub fn failing_on(
    failures: &[usize],
) -> (FailingOn, mpsc::UnboundedReceiver<(usize, Arc<ReceivedEvent>)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        FailingOn {
            failures: failures.to_vec(),
            calls: AtomicUsize::new(0),
            tx,
        },
        rx,
    )
}

impl EventHandler for FailingOn {
    fn handle(&self, event: Arc<ReceivedEvent>) -> BoxFuture<'static, HandlerResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fail = self.failures.contains(&call);
        let _ = self.tx.send((call, event));
        let result: HandlerResult = if fail {
            Err(format!("handler failure on call {}", call).into())
        } else {
            Ok(())
        };
        futures::future::ready(result).boxed()
    }
}

/// Next item from a channel, failing the test after a few seconds.
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("handler channel closed")
}

/// True when nothing arrives on the channel for a short while.
pub async fn stays_quiet<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> bool {
    tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .is_err()
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
