//! In-process broker backend.
//!
//! [`MemoryBroker`] keeps exchanges, queues and connections in shared memory
//! of the current process and follows AMQP 0-9-1 semantics for everything the
//! client layer relies on: default-exchange routing, direct/fanout/topic
//! exchanges, redeclaration checks, at-least-once delivery with requeue on
//! reject or connection loss, and persistence across [`MemoryBroker::restart`].
//! It also offers failure injection so the client contract can be tested
//! without a network.

mod queue;

use crate::error::{Error, Result};
use crate::topic::TopicMatcher;
use crate::transport::{
    BrokerChannel, DeliveryTag, Envelope, RawDelivery, Transport, TransportConnection,
};
use crate::{ConnectionConfig, ExchangeDeclaration, ExchangeKind, QueueBinding};
use parking_lot::{Condvar, Mutex, MutexGuard};
use queue::{Queue, StoredMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const URL_SCHEME: &str = "memory://";

/// Statistics counters for the broker
#[derive(Default)]
struct Counters {
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    messages_acked: AtomicU64,
    messages_rejected: AtomicU64,
    messages_requeued: AtomicU64,
}

/// Statistics about the broker's operation
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct BrokerStats {
    /// Number of currently connected clients
    pub connections: usize,
    pub queues: usize,
    pub exchanges: usize,
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_acked: u64,
    pub messages_rejected: u64,
    pub messages_requeued: u64,
}

/// Point-in-time view of one queue
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct QueueStats {
    /// Messages waiting to be delivered
    pub ready: usize,
    /// Messages delivered but not yet acknowledged
    pub unacked: usize,
    pub consumers: usize,
    pub durable: bool,
}

struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<(String, TopicMatcher)>,
}

impl Exchange {
    fn route(&self, routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &self.bindings {
            let matched = match self.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => key.to_string() == routing_key,
                ExchangeKind::Topic => key.matches(routing_key),
            };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        targets
    }
}

/// Per-connection bookkeeping kept by the broker
struct Session {
    alive: bool,
    subscriptions: Vec<String>,
    unacked: HashMap<DeliveryTag, String>,
}

struct State {
    reachable: bool,
    credentials: Option<(String, String)>,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    sessions: HashMap<u64, Session>,
    next_session: u64,
    next_tag: DeliveryTag,
}

impl State {
    /// Forget a session's subscriptions and requeue what it still holds
    fn sever(&mut self, id: u64) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.alive = false;
        let subscriptions = std::mem::take(&mut session.subscriptions);
        let held: Vec<String> = session.unacked.drain().map(|(_, queue)| queue).collect();

        for name in subscriptions {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.remove_consumer();
            }
        }
        let mut requeued = 0;
        for name in dedup(held) {
            if let Some(queue) = self.queues.get_mut(&name) {
                requeued += queue.requeue_owned_by(id);
            }
        }
        if requeued > 0 {
            debug!("Requeued {} unacknowledged messages of session {}", requeued, id);
        }
    }

    fn session(&mut self, id: u64) -> Result<&mut Session> {
        match self.sessions.get_mut(&id) {
            Some(session) if session.alive => Ok(session),
            _ => Err(Error::Connection("connection dropped by broker".into())),
        }
    }
}

fn dedup(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names.dedup();
    names
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
    counters: Counters,
}

/// An in-process, AMQP-like broker usable as a [`Transport`]
///
/// Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a new, empty broker
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    reachable: true,
                    credentials: None,
                    exchanges: HashMap::new(),
                    queues: HashMap::new(),
                    sessions: HashMap::new(),
                    next_session: 1,
                    next_tag: 1,
                }),
                available: Condvar::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Make new connection attempts fail as if the broker were down
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Require `user:pass@` in the connection URL
    pub fn require_credentials(&self, user: &str, password: &str) {
        self.lock().credentials = Some((user.to_string(), password.to_string()));
    }

    /// Drop every open connection; their unacked messages are requeued
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        for id in ids {
            state.sever(id);
        }
        warn!("Dropped all broker connections");
        self.shared.available.notify_all();
    }

    /// Simulate a broker restart: connections drop, transient state is lost
    pub fn restart(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        for id in ids {
            state.sever(id);
        }
        state.queues.retain(|_, queue| queue.is_durable());
        for queue in state.queues.values_mut() {
            queue.retain_persistent();
        }
        state.exchanges.retain(|_, exchange| exchange.durable);

        let State {
            exchanges, queues, ..
        } = &mut *state;
        for exchange in exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queues.contains_key(queue));
        }
        info!(
            "Broker restarted with {} durable queues and {} durable exchanges",
            state.queues.len(),
            state.exchanges.len()
        );
        self.shared.available.notify_all();
    }

    /// Number of messages ready for delivery on `queue`
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(Queue::depth)
    }

    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        self.lock().queues.get(queue).map(|q| QueueStats {
            ready: q.depth(),
            unacked: q.unacked_len(),
            consumers: q.consumers(),
            durable: q.is_durable(),
        })
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get broker statistics
    pub fn stats(&self) -> BrokerStats {
        let state = self.lock();
        let counters = &self.shared.counters;
        BrokerStats {
            connections: state.sessions.values().filter(|s| s.alive).count(),
            queues: state.queues.len(),
            exchanges: state.exchanges.len(),
            messages_published: counters.messages_published.load(Ordering::Relaxed),
            messages_delivered: counters.messages_delivered.load(Ordering::Relaxed),
            messages_acked: counters.messages_acked.load(Ordering::Relaxed),
            messages_rejected: counters.messages_rejected.load(Ordering::Relaxed),
            messages_requeued: counters.messages_requeued.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock()
    }

    fn check_credentials(expected: &Option<(String, String)>, url: &str) -> Result<()> {
        let Some((user, password)) = expected else {
            return Ok(());
        };
        let rest = &url[URL_SCHEME.len()..];
        let supplied = rest
            .rsplit_once('@')
            .and_then(|(userinfo, _)| userinfo.split_once(':'));
        match supplied {
            Some((u, p)) if u == user && p == password => Ok(()),
            _ => Err(Error::Connection("authentication failed".into())),
        }
    }
}

impl Transport for MemoryBroker {
    type Connection = MemoryConnection;

    fn open(&self, config: &ConnectionConfig) -> Result<MemoryConnection> {
        if !config.url.starts_with(URL_SCHEME) {
            return Err(Error::Connection(format!(
                "unsupported URL for the in-memory broker: {}",
                config.url
            )));
        }

        let mut state = self.lock();
        if !state.reachable {
            return Err(Error::Connection("broker is unreachable".into()));
        }
        Self::check_credentials(&state.credentials, &config.url)?;

        for key in config.transport_options.keys() {
            debug!("Ignoring transport option '{}' on the in-memory broker", key);
        }

        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            Session {
                alive: true,
                subscriptions: Vec::new(),
                unacked: HashMap::new(),
            },
        );
        debug!("Registered session {}", id);

        Ok(MemoryConnection {
            broker: self.clone(),
            id,
            open: true,
            cursor: 0,
        })
    }
}

/// One connection to a [`MemoryBroker`]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    open: bool,
    cursor: usize,
}

impl MemoryConnection {
    fn try_next(&mut self, state: &mut State) -> Result<Option<RawDelivery>> {
        let subscriptions = state.session(self.id)?.subscriptions.clone();
        if subscriptions.is_empty() {
            return Ok(None);
        }

        for offset in 0..subscriptions.len() {
            let index = (self.cursor + offset) % subscriptions.len();
            let name = &subscriptions[index];
            let tag = state.next_tag;
            let Some(message) = state
                .queues
                .get_mut(name)
                .and_then(|queue| queue.checkout(tag, self.id))
            else {
                continue;
            };

            state.next_tag += 1;
            state.session(self.id)?.unacked.insert(tag, name.clone());
            self.cursor = index + 1;
            self.broker
                .shared
                .counters
                .messages_delivered
                .fetch_add(1, Ordering::Relaxed);

            return Ok(Some(RawDelivery {
                tag,
                exchange: message.exchange,
                routing_key: message.routing_key,
                body: message.body,
                content_type: Some(message.content_type),
                delivery_mode: message.delivery_mode,
                message_id: message.message_id,
                redelivered: message.delivery_count > 0,
                delivery_count: message.delivery_count,
            }));
        }
        Ok(None)
    }

    fn take_unacked(&self, state: &mut State, tag: DeliveryTag) -> Result<String> {
        state
            .session(self.id)?
            .unacked
            .remove(&tag)
            .ok_or(Error::UnknownDelivery(tag))
    }
}

impl TransportConnection for MemoryConnection {
    fn heartbeat_check(&mut self) -> Result<()> {
        let mut state = self.broker.lock();
        if let Err(e) = state.session(self.id) {
            self.open = false;
            return Err(e);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;

        // A session severed by the broker stays registered until closed here
        let mut state = self.broker.lock();
        if !state.sessions.contains_key(&self.id) {
            return Ok(());
        }
        state.sever(self.id);
        state.sessions.remove(&self.id);
        self.broker.shared.available.notify_all();
        debug!("Session {} closed", self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
            && self
                .broker
                .lock()
                .sessions
                .get(&self.id)
                .is_some_and(|session| session.alive)
    }
}

impl BrokerChannel for MemoryConnection {
    fn declare_exchange(&mut self, exchange: &ExchangeDeclaration) -> Result<()> {
        let mut state = self.broker.lock();
        state.session(self.id)?;

        if exchange.name.is_empty() {
            return Err(Error::InvalidName("the default exchange cannot be declared".into()));
        }

        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing.kind != exchange.kind => Err(Error::BindingConflict {
                name: exchange.name.clone(),
                reason: format!("kind {:?} differs from {:?}", exchange.kind, existing.kind),
            }),
            Some(existing) if existing.durable != exchange.durable => Err(Error::BindingConflict {
                name: exchange.name.clone(),
                reason: format!(
                    "durable={} differs from durable={}",
                    exchange.durable, existing.durable
                ),
            }),
            Some(_) => Ok(()),
            None => {
                debug!("Declaring {:?} exchange '{}'", exchange.kind, exchange.name);
                state.exchanges.insert(
                    exchange.name.clone(),
                    Exchange {
                        kind: exchange.kind,
                        durable: exchange.durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(&mut self, queue: &QueueBinding) -> Result<()> {
        let mut state = self.broker.lock();
        state.session(self.id)?;

        match state.queues.get(&queue.name) {
            Some(existing) if existing.is_durable() != queue.durable => {
                Err(Error::BindingConflict {
                    name: queue.name.clone(),
                    reason: format!(
                        "durable={} differs from durable={}",
                        queue.durable,
                        existing.is_durable()
                    ),
                })
            }
            Some(_) => Ok(()),
            None => {
                debug!("Declaring queue '{}' (durable: {})", queue.name, queue.durable);
                state.queues.insert(queue.name.clone(), Queue::new(queue.durable));
                Ok(())
            }
        }
    }

    fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.session(self.id)?;

        if exchange.is_empty() {
            return Err(Error::InvalidName("queues cannot be bound to the default exchange".into()));
        }
        if !state.queues.contains_key(queue) {
            return Err(Error::NotFound(format!("queue '{}'", queue)));
        }
        let target = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::NotFound(format!("exchange '{}'", exchange)))?;

        let matcher = TopicMatcher::new(routing_key);
        if !target.bindings.iter().any(|(q, k)| q == queue && *k == matcher) {
            debug!("Binding queue '{}' to '{}' with key {}", queue, exchange, routing_key);
            target.bindings.push((queue.to_string(), matcher));
        }
        Ok(())
    }

    fn publish(&mut self, envelope: Envelope) -> Result<()> {
        let mut state = self.broker.lock();
        if state.session(self.id).is_err() {
            return Err(Error::Publish("connection dropped by broker".into()));
        }

        let targets = if envelope.exchange.is_empty() {
            if state.queues.contains_key(&envelope.routing_key) {
                vec![envelope.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            state
                .exchanges
                .get(&envelope.exchange)
                .ok_or_else(|| Error::Publish(format!("no exchange '{}'", envelope.exchange)))?
                .route(&envelope.routing_key)
        };

        if targets.is_empty() {
            if envelope.mandatory {
                return Err(Error::Publish(format!(
                    "message with routing key {} is unroutable",
                    envelope.routing_key
                )));
            }
            debug!("Dropping unroutable message with routing key {}", envelope.routing_key);
        }

        let stored = StoredMessage {
            exchange: envelope.exchange,
            routing_key: envelope.routing_key,
            body: envelope.body,
            content_type: envelope.content_type.mime().to_string(),
            delivery_mode: envelope.delivery_mode,
            message_id: envelope.message_id,
            delivery_count: 0,
        };
        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.push(stored.clone());
            }
        }

        self.broker
            .shared
            .counters
            .messages_published
            .fetch_add(1, Ordering::Relaxed);
        self.broker.shared.available.notify_all();
        Ok(())
    }

    fn consume(&mut self, queues: &[String]) -> Result<()> {
        let mut state = self.broker.lock();
        state.session(self.id)?;

        if let Some(missing) = queues.iter().find(|q| !state.queues.contains_key(*q)) {
            return Err(Error::NotFound(format!("queue '{}'", missing)));
        }
        for name in queues {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.add_consumer();
            }
        }
        state.session(self.id)?.subscriptions.extend(queues.iter().cloned());
        self.cursor = 0;
        Ok(())
    }

    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<RawDelivery>> {
        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.broker.shared);
        let mut state = shared.state.lock();

        loop {
            if let Some(delivery) = self.try_next(&mut state)? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            shared.available.wait_for(&mut state, deadline - now);
        }
    }

    fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        let mut state = self.broker.lock();
        let name = self.take_unacked(&mut state, tag)?;
        if let Some(queue) = state.queues.get_mut(&name) {
            queue.ack(tag);
        }
        self.broker
            .shared
            .counters
            .messages_acked
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let mut state = self.broker.lock();
        let name = self.take_unacked(&mut state, tag)?;
        let counters = &self.broker.shared.counters;

        if let Some(queue) = state.queues.get_mut(&name) {
            if requeue {
                queue.requeue(tag);
                counters.messages_requeued.fetch_add(1, Ordering::Relaxed);
            } else {
                queue.ack(tag);
            }
        }
        counters.messages_rejected.fetch_add(1, Ordering::Relaxed);
        if requeue {
            self.broker.shared.available.notify_all();
        }
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        let mut state = self.broker.lock();
        let subscriptions = std::mem::take(&mut state.session(self.id)?.subscriptions);
        for name in subscriptions {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.remove_consumer();
            }
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
