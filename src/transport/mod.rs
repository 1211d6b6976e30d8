//! The seam between the client layer and a concrete broker backend.
//!
//! A backend implements [`Transport`] to open connections and
//! [`BrokerChannel`] for the primitives the client layer needs. Everything
//! else in the crate talks to the backend through [`Connection`], which owns
//! the lifecycle rules: idempotent close, heartbeat window, and single-use
//! acknowledgment handles.

#[cfg(feature = "amqp")]
pub mod amqp;

use crate::client::{AckHandle, Delivery};
use crate::error::{Error, Result};
use crate::message::{ContentType, DeliveryMode};
use crate::{ConnectionConfig, ConnectionId, ExchangeDeclaration, QueueBinding};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;

/// Delivery tag assigned by the backend, unique per connection
pub type DeliveryTag = u64;

/// Opens connections to a broker
pub trait Transport {
    type Connection: BrokerChannel + 'static;

    fn open(&self, config: &ConnectionConfig) -> Result<Self::Connection>;
}

/// Lifecycle of one broker connection
pub trait TransportConnection: Send {
    /// Fails with [`Error::Connection`] when the broker side is gone
    fn heartbeat_check(&mut self) -> Result<()>;

    /// Release the connection; calling it again must be harmless
    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Broker primitives on top of an open connection
pub trait BrokerChannel: TransportConnection {
    fn declare_exchange(&mut self, exchange: &ExchangeDeclaration) -> Result<()>;

    fn declare_queue(&mut self, queue: &QueueBinding) -> Result<()>;

    fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    fn publish(&mut self, envelope: Envelope) -> Result<()>;

    /// Start receiving from the given queues
    fn consume(&mut self, queues: &[String]) -> Result<()>;

    /// Wait at most `timeout` for the next delivery
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<RawDelivery>>;

    fn ack(&mut self, tag: DeliveryTag) -> Result<()>;

    fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// Stop receiving; unacknowledged deliveries stay with the connection
    fn cancel(&mut self) -> Result<()>;
}

/// An encoded message on its way to the broker
#[derive(Debug, Clone)]
pub struct Envelope {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub content_type: ContentType,
    pub delivery_mode: DeliveryMode,
    pub mandatory: bool,
    pub message_id: Option<String>,
}

/// A message as handed over by the backend, before decoding
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub message_id: Option<String>,
    pub redelivered: bool,
    /// Number of earlier deliveries of this message
    pub delivery_count: u32,
}

/// An open broker connection, exclusively owned by one producer or consumer
pub struct Connection {
    id: ConnectionId,
    config: ConnectionConfig,
    inner: Box<dyn BrokerChannel>,
    closed: bool,
    broken: bool,
    last_heartbeat: Instant,
}

impl Connection {
    /// Open a connection through `transport`
    pub fn open<T: Transport + ?Sized>(transport: &T, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Opening connection (heartbeat: {}s)",
            config.heartbeat_interval.as_secs()
        );

        let inner = transport.open(&config)?;
        let id = ConnectionId::new();
        debug!("Connection {} established", id.as_str());

        Ok(Self {
            id,
            config,
            inner: Box::new(inner),
            closed: false,
            broken: false,
            last_heartbeat: Instant::now(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        !self.closed && !self.broken && self.inner.is_open()
    }

    /// Keep the connection alive; must be called periodically by blocking callers
    pub fn heartbeat_check(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = self.inner.heartbeat_check();
        self.track(result)
    }

    /// Close the connection; closing twice is a no-op
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!("Closing connection {}", self.id.as_str());
        self.inner.close()
    }

    /// Acknowledge a delivery, removing it from the broker
    pub fn ack(&mut self, handle: &AckHandle) -> Result<()> {
        self.check_handle(handle)?;
        handle.mark_resolved()?;
        let result = self.inner.ack(handle.tag());
        self.track(result)
    }

    /// Negatively acknowledge a delivery, optionally asking for redelivery
    pub fn reject(&mut self, handle: &AckHandle, requeue: bool) -> Result<()> {
        self.check_handle(handle)?;
        handle.mark_resolved()?;
        let result = self.inner.reject(handle.tag(), requeue);
        self.track(result)
    }

    pub(crate) fn declare_exchange(&mut self, exchange: &ExchangeDeclaration) -> Result<()> {
        self.ensure_open()?;
        let result = self.inner.declare_exchange(exchange);
        self.track(result)
    }

    pub(crate) fn declare_queue(&mut self, queue: &QueueBinding) -> Result<()> {
        self.ensure_open()?;
        let result = self.inner.declare_queue(queue);
        self.track(result)
    }

    pub(crate) fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let result = self.inner.bind_queue(queue, exchange, routing_key);
        self.track(result)
    }

    pub(crate) fn publish(&mut self, envelope: Envelope) -> Result<()> {
        if let Err(e) = self.ensure_open() {
            return Err(Error::Publish(e.to_string()));
        }
        let result = self.inner.publish(envelope);
        self.track(result)
    }

    /// Subscribe to `queues` for [`receive`](Self::receive)
    pub fn consume(&mut self, queues: &[String]) -> Result<()> {
        self.ensure_open()?;
        let result = self.inner.consume(queues);
        self.track(result)
    }

    /// Wait at most `timeout` for the next delivery on the subscribed queues.
    ///
    /// A delivery whose body cannot be decoded is rejected without requeue
    /// and reported as an error.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        let Some(raw) = self.next_delivery(timeout)? else {
            return Ok(None);
        };
        match Delivery::from_raw(raw, self.id) {
            Ok(delivery) => Ok(Some(delivery)),
            Err((handle, e)) => {
                self.reject(&handle, false)?;
                Err(e)
            }
        }
    }

    pub(crate) fn next_delivery(&mut self, timeout: Duration) -> Result<Option<RawDelivery>> {
        self.ensure_open()?;
        let result = self.inner.next_delivery(timeout);
        self.track(result)
    }

    /// Stop receiving; deliveries already handed out still need resolving
    pub fn cancel(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = self.inner.cancel();
        self.track(result)
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Connection("connection is closed".into()));
        }
        if self.broken || !self.inner.is_open() {
            self.broken = true;
            return Err(Error::Connection("connection was lost".into()));
        }

        let interval = self.config.heartbeat_interval;
        if !interval.is_zero() && self.last_heartbeat.elapsed() > interval * 2 {
            warn!(
                "Connection {} missed its heartbeat window ({}s)",
                self.id.as_str(),
                interval.as_secs()
            );
            self.broken = true;
            if let Err(e) = self.inner.close() {
                warn!("Failed to close connection {}: {}", self.id.as_str(), e);
            }
            return Err(Error::Connection("missed heartbeat window".into()));
        }
        Ok(())
    }

    /// Any successful exchange with the broker counts as a heartbeat
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.last_heartbeat = Instant::now(),
            Err(e) if e.is_fatal() => self.broken = true,
            Err(_) => {}
        }
        result
    }

    fn check_handle(&mut self, handle: &AckHandle) -> Result<()> {
        if handle.connection() != self.id {
            return Err(Error::UnknownDelivery(handle.tag()));
        }
        self.ensure_open()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close connection {}: {}", self.id.as_str(), e);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("url", &self.config.url)
            .field("closed", &self.closed)
            .field("broken", &self.broken)
            .finish()
    }
}
