//! One-call composition of connection, bindings and a producer or consumer role.
//!
//! ```no_run
//! use burrow::{BrokerClient, ConnectionConfig, HandlerResult, MemoryBroker, Message, QueueBinding, Role, Work};
//!
//! # fn main() -> burrow::Result<()> {
//! let broker = MemoryBroker::new();
//! let config = ConnectionConfig::new("memory://local");
//!
//! BrokerClient::new(config.clone())
//!     .with_queues([QueueBinding::new("jobs")])
//!     .works_as_a(Role::Producer)
//!     .run(&broker, Work::Publish(Message::text("hello", "jobs")))?;
//!
//! let consumer = BrokerClient::new(config)
//!     .with_queues([QueueBinding::new("jobs")])
//!     .works_as_a(Role::Consumer);
//! let stop = consumer.stop_handle();
//! consumer.run(&broker, Work::consume(move |_: &Message| {
//!     stop.stop();
//!     HandlerResult::Ack
//! }))?;
//! # Ok(())
//! # }
//! ```

use crate::binding::{bind_all, declare_exchange};
use crate::client::{Consumer, ConsumerOptions, ConsumerReport, Handler, Producer, StopHandle};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::{Connection, Transport};
use crate::{ConnectionConfig, ExchangeDeclaration, QueueBinding};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What a composed client does once connected
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Publish one message and return
    Producer,
    /// Consume until stopped
    Consumer,
}

/// Input for [`BrokerClient::run`], matching the role
pub enum Work {
    Publish(Message),
    Consume(Box<dyn Handler>),
}

impl Work {
    pub fn consume(handler: impl Handler + 'static) -> Self {
        Work::Consume(Box::new(handler))
    }
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Work::Publish(message) => f.debug_tuple("Publish").field(message).finish(),
            Work::Consume(_) => f.write_str("Consume(..)"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RunOutcome {
    Published,
    Consumed(ConsumerReport),
}

/// Builder for a runnable broker client.
///
/// Every configuration call consumes the builder and returns a new value, so
/// a configured client can be cloned and reused. Clones share the stop
/// handle.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    config: ConnectionConfig,
    exchange: Option<ExchangeDeclaration>,
    queues: Vec<QueueBinding>,
    role: Option<Role>,
    consumer_options: ConsumerOptions,
    stop: StopHandle,
}

impl BrokerClient {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            exchange: None,
            queues: Vec::new(),
            role: None,
            consumer_options: ConsumerOptions::default(),
            stop: StopHandle::new(),
        }
    }

    pub fn with_exchange(mut self, exchange: ExchangeDeclaration) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn with_queues(mut self, bindings: impl IntoIterator<Item = QueueBinding>) -> Self {
        self.queues.extend(bindings);
        self
    }

    pub fn works_as_a(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_consumer_options(mut self, options: ConsumerOptions) -> Self {
        self.consumer_options = options;
        self
    }

    /// Replace the stop handle; a handle can stop only one consumer run
    pub fn with_stop_handle(mut self, handle: StopHandle) -> Self {
        self.stop = handle;
        self
    }

    /// Handle for stopping a consumer started by [`run`](Self::run)
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn queues(&self) -> &[QueueBinding] {
        &self.queues
    }

    pub fn exchange(&self) -> Option<&ExchangeDeclaration> {
        self.exchange.as_ref()
    }

    /// Connect, declare, then publish once or consume until stopped.
    ///
    /// The connection is closed before returning, whatever the outcome.
    pub fn run<T: Transport + ?Sized>(&self, transport: &T, work: Work) -> Result<RunOutcome> {
        let role = self
            .role
            .ok_or_else(|| Error::InvalidConfig("no role set, call works_as_a first".into()))?;

        match (role, &work) {
            (Role::Producer, Work::Publish(_)) => {}
            (Role::Consumer, Work::Consume(_)) if self.queues.is_empty() => {
                return Err(Error::InvalidConfig("consumer role needs at least one queue".into()));
            }
            (Role::Consumer, Work::Consume(_)) => {}
            (role, work) => {
                return Err(Error::InvalidConfig(format!(
                    "{:?} role cannot run {:?}",
                    role, work
                )));
            }
        }

        let mut connection = Connection::open(transport, self.config.clone())?;
        let result = self.run_on(&mut connection, work);

        if let Err(e) = connection.close() {
            warn!("Closing connection after run failed: {}", e);
        }
        result
    }

    fn run_on(&self, connection: &mut Connection, work: Work) -> Result<RunOutcome> {
        if let Some(exchange) = &self.exchange {
            declare_exchange(connection, exchange)?;
        }
        bind_all(connection, &self.queues)?;

        match work {
            Work::Publish(message) => {
                let producer = match &self.exchange {
                    Some(exchange) => Producer::to_exchange(exchange.name.clone()),
                    None => Producer::new(),
                };
                producer.publish(connection, &message)?;
                info!("Published one message with routing key {}", message.routing_key());
                Ok(RunOutcome::Published)
            }
            Work::Consume(handler) => {
                let queues = self.queues.iter().map(|q| q.name.clone()).collect();
                let mut consumer = Consumer::from_boxed(queues, handler)
                    .with_options(self.consumer_options)
                    .with_stop_handle(self.stop.clone());
                consumer.start(connection).map(RunOutcome::Consumed)
            }
        }
    }
}
