//! In-process topic broker.
//!
//! Implements [`Transport`] with the AMQP semantics the broker client relies
//! on: durable topic and fanout exchanges, idempotent bindings, round-robin
//! consumers bounded by prefetch, ack and reject with requeue or
//! dead-lettering, and requeue of unacknowledged messages when a connection
//! goes away.
//!
//! Fault injection hooks let tests refuse connections, drop every live
//! connection, or fail over to a broker that has lost all topology.
//!
//! # Example
//!
//! ```ignore
//! let broker = InMemoryBroker::new();
//! let client = MessageBroker::new(config, Arc::new(broker.clone()))?;
//! client.connect().await?;
//!
//! broker.drop_connections(); // client reconnects and rebinds on its own
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::{
    Acknowledger, Delivery, DeliveryStream, ExchangeKind, MessageProperties, QueueSpec, Result,
    Session, Transport, TransportError,
};
use crate::bus::routing::topic_matches;

/// A message as it crossed the wire, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// A queue-to-exchange binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub pattern: String,
}

#[derive(Debug, Clone)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    id: u64,
    tag: String,
    connection: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    message: Message,
    consumer: u64,
}

#[derive(Default)]
struct QueueState {
    dead_letter_exchange: Option<String>,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

impl QueueState {
    /// Remove a consumer and put its unacknowledged messages back at the
    /// head of the queue, in delivery order.
    fn remove_consumer(&mut self, id: u64) {
        self.consumers.retain(|c| c.id != id);

        let mut orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == id)
            .map(|(t, _)| *t)
            .collect();
        orphaned.sort_unstable();
        for delivery_tag in orphaned.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&delivery_tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }

        if self.next_consumer >= self.consumers.len() {
            self.next_consumer = 0;
        }
    }

    /// Forget an outstanding delivery and free its prefetch slot.
    fn settle(&mut self, delivery_tag: u64) -> Option<Message> {
        let unacked = self.unacked.remove(&delivery_tag)?;
        if let Some(consumer) = self
            .consumers
            .iter_mut()
            .find(|c| c.id == unacked.consumer)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        Some(unacked.message)
    }
}

#[derive(Default)]
struct BrokerState {
    refuse_connections: bool,
    connect_attempts: usize,
    next_connection: u64,
    next_consumer: u64,
    connections: HashMap<u64, watch::Sender<bool>>,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
}

impl BrokerState {
    /// Enqueue a message on every queue whose binding matches. A queue
    /// matched by several bindings receives the message once.
    fn route(&mut self, exchange: &str, message: &Message) -> Vec<String> {
        let Some(kind) = self.exchanges.get(exchange).copied() else {
            return Vec::new();
        };

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let hit = match kind {
                ExchangeKind::Topic => topic_matches(&binding.pattern, &message.routing_key),
                ExchangeKind::Fanout => true,
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
        }
        targets
    }

    fn disconnect(&mut self, connection: u64) {
        if let Some(closed) = self.connections.remove(&connection) {
            closed.send_replace(true);
        }
        for queue in self.queues.values_mut() {
            let gone: Vec<u64> = queue
                .consumers
                .iter()
                .filter(|c| c.connection == connection)
                .map(|c| c.id)
                .collect();
            for id in gone {
                queue.remove_consumer(id);
            }
        }
    }
}

fn lock_state(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hand ready messages to consumers with free prefetch capacity, round-robin.
fn pump(shared: &Weak<Mutex<BrokerState>>, state: &mut BrokerState, queue_name: &str) {
    let Some(queue) = state.queues.get_mut(queue_name) else {
        return;
    };

    while !queue.ready.is_empty() {
        let count = queue.consumers.len();
        let Some(index) = (0..count)
            .map(|offset| (queue.next_consumer + offset) % count)
            .find(|&i| queue.consumers[i].has_capacity())
        else {
            break;
        };
        queue.next_consumer = (index + 1) % count;

        let Some(message) = queue.ready.pop_front() else {
            break;
        };
        queue.next_tag += 1;
        let delivery_tag = queue.next_tag;

        let consumer = &mut queue.consumers[index];
        let delivery = Delivery::new(
            message.routing_key.clone(),
            message.body.clone(),
            message.properties.clone(),
            message.redelivered,
            Box::new(MemoryAcker {
                broker: shared.clone(),
                queue: queue_name.to_string(),
                delivery_tag,
                connection: consumer.connection,
            }),
        );

        if consumer.sender.send(Ok(delivery)).is_err() {
            // Consumer stream was dropped without cancelling.
            let id = consumer.id;
            queue.ready.push_front(message);
            queue.remove_consumer(id);
            continue;
        }

        consumer.in_flight += 1;
        let consumer_id = consumer.id;
        queue.unacked.insert(
            delivery_tag,
            Unacked {
                message,
                consumer: consumer_id,
            },
        );
    }
}

fn pump_all(shared: &Weak<Mutex<BrokerState>>, state: &mut BrokerState) {
    let names: Vec<String> = state.queues.keys().cloned().collect();
    for name in names {
        pump(shared, state, &name);
    }
}

/// In-process broker shared by every session it hands out.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_state(&self.state)
    }

    fn weak(&self) -> Weak<Mutex<BrokerState>> {
        Arc::downgrade(&self.state)
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Make every subsequent connection attempt fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Sever every live connection. Topology survives, unacknowledged
    /// messages are requeued.
    pub fn drop_connections(&self) {
        let weak = self.weak();
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in &ids {
            state.disconnect(*id);
        }
        pump_all(&weak, &mut state);
        info!(connections = ids.len(), "In-memory broker dropped connections");
    }

    /// Sever every connection and forget all exchanges, queues, bindings and
    /// pending messages, as if clients had failed over to a fresh node.
    pub fn fail_over(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.disconnect(id);
        }
        state.exchanges.clear();
        state.queues.clear();
        state.bindings.clear();
        info!("In-memory broker failed over, topology lost");
    }

    /// Route a message as a peer service would, without a session.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let weak = self.weak();
        let mut state = self.lock();
        publish_locked(
            &weak,
            &mut state,
            exchange,
            routing_key,
            body.into(),
            MessageProperties::default(),
        )
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.lock().bindings.clone()
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, pattern: &str) -> bool {
        self.lock()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern)
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(exchange).copied()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Messages waiting in a queue, not yet delivered.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from a queue and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    fn close_connection(&self, connection: u64) {
        let weak = self.weak();
        let mut state = self.lock();
        state.disconnect(connection);
        pump_all(&weak, &mut state);
    }
}

fn publish_locked(
    weak: &Weak<Mutex<BrokerState>>,
    state: &mut BrokerState,
    exchange: &str,
    routing_key: &str,
    body: Vec<u8>,
    properties: MessageProperties,
) -> Result<()> {
    if !state.exchanges.contains_key(exchange) {
        return Err(TransportError::NotFound(format!("exchange '{}'", exchange)));
    }

    state.published.push(PublishedMessage {
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        body: body.clone(),
        properties: properties.clone(),
    });

    let message = Message {
        routing_key: routing_key.to_string(),
        body,
        properties,
        redelivered: false,
    };
    let targets = state.route(exchange, &message);
    debug!(exchange, routing_key, queues = targets.len(), "Routed message");
    for target in targets {
        pump(weak, state, &target);
    }
    Ok(())
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Session>> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.refuse_connections {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        state.next_connection += 1;
        let connection = state.next_connection;
        let (closed_tx, closed_rx) = watch::channel(false);
        state.connections.insert(connection, closed_tx);
        debug!(connection, "In-memory connection opened");

        Ok(Arc::new(MemorySession {
            broker: self.clone(),
            connection,
            prefetch: AtomicU16::new(0),
            closed: closed_rx,
        }))
    }
}

struct MemorySession {
    broker: InMemoryBroker,
    connection: u64,
    prefetch: AtomicU16,
    closed: watch::Receiver<bool>,
}

impl MemorySession {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.broker.lock();
        if state.connections.contains_key(&self.connection) {
            Ok(state)
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.open_state()?;
        self.prefetch.store(count, Ordering::Relaxed);
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut state = self.open_state()?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(TransportError::Channel(format!(
                "PRECONDITION_FAILED - exchange '{}' redeclared as {:?}, exists as {:?}",
                name, kind, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, spec: &QueueSpec) -> Result<()> {
        let mut state = self.open_state()?;
        match state.queues.get(name) {
            Some(existing) if existing.dead_letter_exchange != spec.dead_letter_exchange => {
                Err(TransportError::Channel(format!(
                    "PRECONDITION_FAILED - queue '{}' redeclared with different dead-letter exchange",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        dead_letter_exchange: spec.dead_letter_exchange.clone(),
                        ..Default::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::NotFound(format!("queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::NotFound(format!("exchange '{}'", exchange)));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        let weak = self.broker.weak();
        let mut state = self.open_state()?;
        publish_locked(
            &weak,
            &mut state,
            exchange,
            routing_key,
            body.to_vec(),
            properties.clone(),
        )
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let weak = self.broker.weak();
        let mut state = self.open_state()?;

        if !state.queues.contains_key(queue) {
            return Err(TransportError::NotFound(format!("queue '{}'", queue)));
        }
        // Tags are scoped to the channel: reuse is a NOT_ALLOWED error.
        let reused = state.queues.values().any(|q| {
            q.consumers
                .iter()
                .any(|c| c.connection == self.connection && c.tag == consumer_tag)
        });
        if reused {
            return Err(TransportError::Channel(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                consumer_tag
            )));
        }

        state.next_consumer += 1;
        let id = state.next_consumer;
        let (sender, receiver) = mpsc::unbounded_channel();

        let Some(slots) = state.queues.get_mut(queue) else {
            return Err(TransportError::NotFound(format!("queue '{}'", queue)));
        };
        slots.consumers.push(ConsumerSlot {
            id,
            tag: consumer_tag.to_string(),
            connection: self.connection,
            prefetch: self.prefetch.load(Ordering::Relaxed),
            in_flight: 0,
            sender,
        });
        pump(&weak, &mut state, queue);

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    fn is_open(&self) -> bool {
        self.broker.lock().connections.contains_key(&self.connection)
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        // Err means the broker dropped the sender, which also means closed.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<()> {
        self.broker.close_connection(self.connection);
        Ok(())
    }
}

enum Settlement {
    Ack,
    Requeue,
    Discard,
}

struct MemoryAcker {
    broker: Weak<Mutex<BrokerState>>,
    queue: String,
    delivery_tag: u64,
    connection: u64,
}

impl MemoryAcker {
    fn settle(&self, settlement: Settlement) -> Result<()> {
        let shared = self.broker.upgrade().ok_or(TransportError::Closed)?;
        let mut state = lock_state(&shared);
        if !state.connections.contains_key(&self.connection) {
            return Err(TransportError::Closed);
        }

        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| TransportError::NotFound(format!("queue '{}'", self.queue)))?;
        let mut message = queue.settle(self.delivery_tag).ok_or_else(|| {
            TransportError::Channel(format!("unknown delivery tag {}", self.delivery_tag))
        })?;

        let mut touched = vec![self.queue.clone()];
        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            Settlement::Discard => {
                if let Some(exchange) = queue.dead_letter_exchange.clone() {
                    message.redelivered = false;
                    touched.extend(state.route(&exchange, &message));
                }
            }
        }

        for name in touched {
            pump(&self.broker, &mut state, &name);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(Settlement::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        })
    }
}
