//! Connection lifecycle: connect with backoff, supervise, reconnect, close.
//!
//! The manager exclusively owns the live [`Session`]. Publisher and
//! subscriber hold a cloned handle and borrow the current session per call.
//!
//! State machine:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!      ▲                        │                  │
//!      └──────────failed────────┘◀──session lost───┘
//!
//! any state ──close──▶ Closed (terminal)
//! ```
//!
//! After a lost session a supervisor task reconnects without an attempt
//! limit, re-declares the exchange and replays every recorded subscription
//! before the state returns to `Connected`.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use backon::BackoffBuilder;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::subscriber::{self, Registration};
use super::{ConnectionError, EventHandler, PublishError, SubscribeError};
use crate::config::BrokerConfig;
use crate::transport::{
    ExchangeKind, MessageProperties, QueueSpec, Session, Transport, TransportError,
};
use crate::utils::retry::{connect_backoff, reconnect_backoff};

/// Lifecycle state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal, after `close()`.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A freshly opened session with topology declared and subscriptions live.
struct Established {
    session: Arc<dyn Session>,
    consumers: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct Tasks {
    supervisor: Option<JoinHandle<()>>,
    consumers: Vec<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        for consumer in self.consumers.drain(..) {
            consumer.abort();
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: BrokerConfig,
    exchange: String,
    state: watch::Sender<ConnectionState>,
    session: watch::Sender<Option<Arc<dyn Session>>>,
    /// Serializes connection attempts, reconnection and subscription setup.
    topology: Mutex<()>,
    /// Serializes writes on the shared channel.
    send_lock: Mutex<()>,
    registrations: StdMutex<Vec<Arc<Registration>>>,
    tasks: StdMutex<Tasks>,
}

/// Owns the broker session and keeps it alive.
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: BrokerConfig, transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (session, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                transport,
                exchange: config.exchange_name(),
                config,
                state,
                session,
                topology: Mutex::new(()),
                send_lock: Mutex::new(()),
                registrations: StdMutex::new(Vec::new()),
                tasks: StdMutex::new(Tasks::default()),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Name of the shared topic exchange.
    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    /// Connect with the configured attempt count and base delay.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let config = &self.inner.config;
        self.connect_with(config.connect_attempts, config.retry_base_delay())
            .await
    }

    /// Connect, retrying up to `max_attempts` times in total.
    ///
    /// Sleeps `base_delay`, then 1.5x the previous delay between attempts,
    /// capped at the configured maximum. A no-op when already connected.
    pub async fn connect_with(
        &self,
        max_attempts: usize,
        base_delay: Duration,
    ) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let _topology = inner.topology.lock().await;

        match inner.current_state() {
            ConnectionState::Closed => return Err(ConnectionError::Closed),
            ConnectionState::Connected if inner.session_open() => return Ok(()),
            _ => {}
        }

        let max_attempts = max_attempts.max(1);
        let mut delays =
            connect_backoff(max_attempts, base_delay, inner.config.retry_max_delay()).build();
        inner.transition(ConnectionState::Connecting);

        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(attempt, max_attempts, "Connecting to broker");

            let error = match inner.establish().await {
                Ok(established) => {
                    if let Some(rejected) = inner.install(established) {
                        close_quietly(rejected).await;
                        return Err(ConnectionError::Closed);
                    }
                    inner.ensure_supervisor();
                    info!(
                        attempt,
                        exchange = %inner.exchange,
                        "Connected to broker"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            if inner.is_closed() {
                return Err(ConnectionError::Closed);
            }

            match delays.next() {
                Some(delay) => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "Broker connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if inner.is_closed() {
                        return Err(ConnectionError::Closed);
                    }
                }
                None => {
                    inner.transition(ConnectionState::Disconnected);
                    error!(
                        attempts = attempt,
                        error = %error,
                        "Giving up connecting to broker"
                    );
                    return Err(ConnectionError::Exhausted {
                        attempts: attempt,
                        source: error,
                    });
                }
            }
        }
    }

    /// True when connected and the session reports itself open.
    pub fn is_connected(&self) -> bool {
        self.inner.current_state() == ConnectionState::Connected && self.inner.session_open()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.current_state()
    }

    /// Change feed of the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Binding patterns of every recorded subscription, in registration order.
    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.inner
            .lock_registrations()
            .iter()
            .map(|r| r.patterns.clone())
            .collect()
    }

    /// Shut down for good. Stops the supervisor and every receive loop and
    /// closes the session. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.state.send_replace(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }

        let session = {
            let mut tasks = inner.lock_tasks();
            tasks.abort_all();
            inner.session.send_replace(None)
        };
        if let Some(session) = session {
            close_quietly(session).await;
        }
        info!("Broker connection closed");
    }

    /// Send one message on the shared exchange.
    ///
    /// Fails with `ConnectionClosed` if `close()` runs while the send is in
    /// flight.
    pub(crate) async fn send(
        &self,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), PublishError> {
        let inner = &self.inner;
        let session = self.live_session().map_err(|state| match state {
            ConnectionState::Closed => PublishError::ConnectionClosed,
            _ => PublishError::NotConnected,
        })?;

        let mut state = inner.state.subscribe();
        let _send = tokio::select! {
            guard = inner.send_lock.lock() => guard,
            _ = wait_closed(&mut state) => return Err(PublishError::ConnectionClosed),
        };

        tokio::select! {
            result = session.publish(&inner.exchange, routing_key, body, properties) => {
                result.map_err(PublishError::from)
            }
            _ = wait_closed(&mut state) => Err(PublishError::ConnectionClosed),
        }
    }

    /// Activate and record a subscription.
    pub(crate) async fn register(
        &self,
        patterns: Vec<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscribeError> {
        let inner = &self.inner;
        let _topology = inner.topology.lock().await;

        let session = self.live_session().map_err(|state| match state {
            ConnectionState::Closed => SubscribeError::ConnectionClosed,
            _ => SubscribeError::NotConnected,
        })?;

        // Registrations only grow, and only under the topology lock.
        let ordinal = inner.lock_registrations().len() + 1;
        let registration = Arc::new(Registration {
            patterns,
            handler,
            consumer_tag: inner.config.consumer_tag(ordinal),
        });

        let consumer = subscriber::activate(&session, &inner.config, &registration).await?;
        {
            let mut tasks = inner.lock_tasks();
            if inner.is_closed() {
                consumer.abort();
                return Err(SubscribeError::ConnectionClosed);
            }
            tasks.consumers.push(consumer);
        }

        info!(
            patterns = ?registration.patterns,
            consumer_tag = %registration.consumer_tag,
            "Subscription registered"
        );
        inner.lock_registrations().push(registration);
        Ok(())
    }

    /// The current session if connected, else the current state.
    fn live_session(&self) -> Result<Arc<dyn Session>, ConnectionState> {
        let state = self.inner.current_state();
        if state != ConnectionState::Connected {
            return Err(state);
        }
        match self.inner.current_session() {
            Some(session) if session.is_open() => Ok(session),
            _ => Err(ConnectionState::Disconnected),
        }
    }
}

impl Inner {
    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn is_closed(&self) -> bool {
        self.current_state() == ConnectionState::Closed
    }

    fn current_session(&self) -> Option<Arc<dyn Session>> {
        self.session.borrow().clone()
    }

    fn session_open(&self) -> bool {
        self.session
            .borrow()
            .as_ref()
            .is_some_and(|session| session.is_open())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_registrations(&self) -> MutexGuard<'_, Vec<Arc<Registration>>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` unless closed. Returns whether the state changed.
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "Connection state changed");
            *current = next;
            true
        })
    }

    /// Open a session, declare topology and replay every registration.
    async fn establish(&self) -> Result<Established, TransportError> {
        let session = self.transport.connect().await?;
        match self.prepare(&session).await {
            Ok(consumers) => Ok(Established { session, consumers }),
            Err(e) => {
                close_quietly(session).await;
                Err(e)
            }
        }
    }

    async fn prepare(&self, session: &Arc<dyn Session>) -> Result<Vec<JoinHandle<()>>, TransportError> {
        let config = &self.config;
        session.set_prefetch(config.prefetch).await?;
        session
            .declare_exchange(&self.exchange, ExchangeKind::Topic)
            .await?;

        if config.dead_lettering() {
            let dlx = config.dead_letter_exchange();
            let dlq = config.dead_letter_queue();
            session.declare_exchange(&dlx, ExchangeKind::Fanout).await?;
            session.declare_queue(&dlq, &QueueSpec::durable()).await?;
            session.bind_queue(&dlq, &dlx, "").await?;
            debug!(exchange = %dlx, queue = %dlq, "Declared dead-letter topology");
        }

        let registrations: Vec<Arc<Registration>> = self.lock_registrations().clone();
        let mut consumers = Vec::with_capacity(registrations.len());
        for registration in &registrations {
            match subscriber::activate(session, config, registration).await {
                Ok(consumer) => consumers.push(consumer),
                Err(e) => {
                    for consumer in consumers {
                        consumer.abort();
                    }
                    return Err(e.into_transport());
                }
            }
        }
        if !registrations.is_empty() {
            info!(subscriptions = registrations.len(), "Subscriptions restored");
        }
        Ok(consumers)
    }

    /// Make an established session current. Hands the session back when the
    /// manager was closed in the meantime.
    fn install(&self, established: Established) -> Option<Arc<dyn Session>> {
        let mut tasks = self.lock_tasks();
        if self.is_closed() {
            for consumer in established.consumers {
                consumer.abort();
            }
            return Some(established.session);
        }

        for stale in tasks.consumers.drain(..) {
            stale.abort();
        }
        tasks.consumers = established.consumers;
        self.session.send_replace(Some(established.session));
        self.transition(ConnectionState::Connected);
        None
    }

    /// Forget `lost` if it is still the current session.
    fn mark_lost(&self, lost: &Arc<dyn Session>) -> bool {
        let _tasks = self.lock_tasks();
        let current = self.current_session();
        if self.is_closed() || !current.is_some_and(|c| Arc::ptr_eq(&c, lost)) {
            return false;
        }
        self.session.send_replace(None);
        self.transition(ConnectionState::Disconnected);
        true
    }

    fn ensure_supervisor(self: &Arc<Self>) {
        let mut tasks = self.lock_tasks();
        let running = tasks
            .supervisor
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if !running && !self.is_closed() {
            tasks.supervisor = Some(tokio::spawn(supervise(Arc::downgrade(self))));
        }
    }

    /// One reconnection attempt. `Ok(false)` means the manager was closed.
    async fn reconnect_once(&self) -> Result<bool, TransportError> {
        let _topology = self.topology.lock().await;
        if self.is_closed() {
            return Ok(false);
        }
        if self.current_state() == ConnectionState::Connected && self.session_open() {
            // An explicit connect() got there first.
            return Ok(true);
        }

        self.transition(ConnectionState::Connecting);
        match self.establish().await {
            Ok(established) => match self.install(established) {
                None => Ok(true),
                Some(rejected) => {
                    close_quietly(rejected).await;
                    Ok(false)
                }
            },
            Err(e) => {
                self.transition(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }
}

/// Watch the current session and reconnect whenever it is lost.
///
/// Holds only a weak reference between steps so dropping every manager
/// handle ends the task.
async fn supervise(weak: Weak<Inner>) {
    loop {
        let session = match weak.upgrade() {
            Some(inner) => inner.current_session(),
            None => return,
        };
        let Some(session) = session else {
            return;
        };

        session.closed().await;

        let (base_delay, max_delay) = {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.mark_lost(&session) {
                if inner.is_closed() {
                    return;
                }
                continue;
            }
            warn!("Broker connection lost, reconnecting");
            (inner.config.retry_base_delay(), inner.config.retry_max_delay())
        };
        drop(session);

        let mut delays = reconnect_backoff(base_delay, max_delay).build();
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let outcome = inner.reconnect_once().await;
            drop(inner);

            match outcome {
                Ok(true) => {
                    info!(attempt, "Reconnected to broker; subscriptions restored");
                    break;
                }
                Ok(false) => return,
                Err(e) => {
                    let delay = delays.next().unwrap_or(max_delay);
                    warn!(
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

async fn wait_closed(state: &mut watch::Receiver<ConnectionState>) {
    // Err means every manager handle is gone, which is a close as well.
    let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
}

async fn close_quietly(session: Arc<dyn Session>) {
    if let Err(e) = session.close().await {
        debug!(error = %e, "Error closing broker session");
    }
}
