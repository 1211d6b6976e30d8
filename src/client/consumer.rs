//! The blocking consume loop.
//!
//! A consumer moves through `Idle → Running → Draining → Stopped`. While
//! running it repeats receive → dispatch → resolve on a single thread, so at
//! most one delivery is ever outstanding. The stop flag is checked at the top
//! of every iteration and the receive wait is bounded by the tick, which
//! bounds how long `stop()` takes to be noticed.

use super::delivery::{AckHandle, Delivery};
use super::handler::{ErrorSink, Handler, HandlerFailure, HandlerResult, LogSink};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::{Connection, RawDelivery};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default upper bound on how long a receive waits before rechecking the stop flag
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConsumerState {
    Idle,
    Running,
    Draining,
    Stopped,
}

struct Control {
    stop: AtomicBool,
    state: Mutex<ConsumerState>,
}

/// Cooperative stop signal for a consumer, usable from any thread
#[derive(Clone)]
pub struct StopHandle {
    inner: Arc<Control>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Control {
                stop: AtomicBool::new(false),
                state: Mutex::new(ConsumerState::Idle),
            }),
        }
    }

    /// Ask the consumer to stop; an in-flight delivery is still resolved
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        let mut state = self.inner.state.lock();
        if *state == ConsumerState::Running {
            info!("Consumer draining");
            *state = ConsumerState::Draining;
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.lock()
    }

    fn set_state(&self, next: ConsumerState) {
        *self.inner.state.lock() = next;
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("stop_requested", &self.is_stop_requested())
            .field("state", &self.state())
            .finish()
    }
}

/// Limits how often a message may be requeued by its handler.
///
/// Once a message has been redelivered `max_redeliveries` times, a further
/// `Reject { requeue: true }` is turned into a reject without requeue.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryPolicy {
    pub max_redeliveries: Option<u32>,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: Some(5),
        }
    }
}

impl RedeliveryPolicy {
    pub fn unlimited() -> Self {
        Self {
            max_redeliveries: None,
        }
    }

    pub fn limited(max_redeliveries: u32) -> Self {
        Self {
            max_redeliveries: Some(max_redeliveries),
        }
    }

    pub fn allows_requeue(&self, delivery_count: u32) -> bool {
        self.max_redeliveries
            .map_or(true, |max| delivery_count < max)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConsumerOptions {
    /// Receive wait per loop iteration
    #[serde(default = "default_tick", with = "crate::duration_millis", rename = "tick_ms")]
    pub tick: Duration,
    #[serde(default)]
    pub redelivery: RedeliveryPolicy,
}

fn default_tick() -> Duration {
    DEFAULT_TICK
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            redelivery: RedeliveryPolicy::default(),
        }
    }
}

/// Counters collected while a consumer runs
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ConsumerReport {
    pub received: u64,
    pub acked: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub handler_errors: u64,
    /// Requeue requests refused by the redelivery policy
    pub dead_lettered: u64,
}

/// Pulls deliveries from bound queues and resolves each through a handler
pub struct Consumer {
    queues: Vec<String>,
    handler: Box<dyn Handler>,
    sink: Box<dyn ErrorSink>,
    options: ConsumerOptions,
    control: StopHandle,
    report: ConsumerReport,
}

impl Consumer {
    pub fn new<I, S>(queues: I, handler: impl Handler + 'static) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            handler: Box::new(handler),
            sink: Box::new(LogSink),
            options: ConsumerOptions::default(),
            control: StopHandle::new(),
            report: ConsumerReport::default(),
        }
    }

    pub(crate) fn from_boxed(queues: Vec<String>, handler: Box<dyn Handler>) -> Self {
        Self {
            queues,
            handler,
            sink: Box::new(LogSink),
            options: ConsumerOptions::default(),
            control: StopHandle::new(),
            report: ConsumerReport::default(),
        }
    }

    pub fn with_options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Use an externally created stop handle
    pub fn with_stop_handle(mut self, handle: StopHandle) -> Self {
        self.control = handle;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.control.clone()
    }

    pub fn state(&self) -> ConsumerState {
        self.control.state()
    }

    pub fn report(&self) -> &ConsumerReport {
        &self.report
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Run the consume loop until stopped or a fatal error occurs
    pub fn start(&mut self, connection: &mut Connection) -> Result<ConsumerReport> {
        if self.state() != ConsumerState::Idle {
            return Err(Error::InvalidState(format!(
                "consumer cannot start from {:?}",
                self.state()
            )));
        }
        if self.queues.is_empty() {
            return Err(Error::InvalidConfig("consumer needs at least one queue".into()));
        }

        self.control.set_state(ConsumerState::Running);
        info!("Consumer started on queues {:?}", self.queues);

        let result = self.run(connection);
        self.control.set_state(ConsumerState::Stopped);

        match result {
            Ok(()) => {
                info!(
                    "Consumer stopped after {} deliveries ({} acked, {} rejected)",
                    self.report.received, self.report.acked, self.report.rejected
                );
                Ok(self.report.clone())
            }
            Err(e) => {
                warn!("Consumer stopped on fatal error: {}", e);
                Err(e)
            }
        }
    }

    fn run(&mut self, connection: &mut Connection) -> Result<()> {
        connection.consume(&self.queues)?;

        loop {
            if self.control.is_stop_requested() {
                self.control.set_state(ConsumerState::Draining);
                break;
            }

            connection.heartbeat_check()?;

            if let Some(raw) = connection.next_delivery(self.options.tick)? {
                self.dispatch(connection, raw)?;
            }
        }

        debug!("Cancelling subscription on {:?}", self.queues);
        connection.cancel()
    }

    fn dispatch(&mut self, connection: &mut Connection, raw: RawDelivery) -> Result<()> {
        self.report.received += 1;
        let routing_key = raw.routing_key.clone();
        let delivery_count = raw.delivery_count;

        let (handle, outcome) = match Delivery::from_raw(raw, connection.id()) {
            Ok(delivery) => {
                debug!(
                    "Dispatching delivery {} (routing key {})",
                    delivery.ack_handle.tag(),
                    delivery.routing_key
                );
                let outcome = self.invoke(&delivery.message);
                (delivery.ack_handle, outcome)
            }
            Err((handle, e)) => (handle, HandlerResult::error(e)),
        };

        self.resolve(connection, &handle, routing_key, delivery_count, outcome)
    }

    fn invoke(&mut self, message: &Message) -> HandlerResult {
        let handler = &mut self.handler;
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
            Ok(outcome) => outcome,
            Err(payload) => HandlerResult::error(format!(
                "handler panicked: {}",
                panic_message(payload.as_ref())
            )),
        }
    }

    fn resolve(
        &mut self,
        connection: &mut Connection,
        handle: &AckHandle,
        routing_key: String,
        delivery_count: u32,
        outcome: HandlerResult,
    ) -> Result<()> {
        match outcome {
            HandlerResult::Ack => {
                connection.ack(handle)?;
                self.report.acked += 1;
            }
            HandlerResult::Reject { requeue: true }
                if !self.options.redelivery.allows_requeue(delivery_count) =>
            {
                warn!(
                    "Delivery {} was redelivered {} times, rejecting without requeue",
                    handle.tag(),
                    delivery_count
                );
                connection.reject(handle, false)?;
                self.report.rejected += 1;
                self.report.dead_lettered += 1;
            }
            HandlerResult::Reject { requeue } => {
                connection.reject(handle, requeue)?;
                self.report.rejected += 1;
                if requeue {
                    self.report.requeued += 1;
                }
            }
            HandlerResult::Error(cause) => {
                connection.reject(handle, false)?;
                self.report.rejected += 1;
                self.report.handler_errors += 1;
                self.sink.report(&HandlerFailure {
                    tag: handle.tag(),
                    routing_key,
                    cause,
                });
            }
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
