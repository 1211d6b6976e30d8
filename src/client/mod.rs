//! Producer and consumer roles on top of an open [`Connection`](crate::Connection).

mod consumer;
mod delivery;
mod handler;
mod producer;

pub use consumer::{
    Consumer, ConsumerOptions, ConsumerReport, ConsumerState, RedeliveryPolicy, StopHandle,
    DEFAULT_TICK,
};
pub use delivery::{AckHandle, Delivery};
pub use handler::{ErrorSink, Handler, HandlerError, HandlerFailure, HandlerResult, LogSink};
pub use producer::Producer;
