use crate::message::Message;
use crate::transport::DeliveryTag;
use tracing::error;

/// Error type a handler may fail with
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of handling one message
#[derive(Debug)]
pub enum HandlerResult {
    Ack,
    Reject { requeue: bool },
    Error(HandlerError),
}

impl HandlerResult {
    pub fn reject(requeue: bool) -> Self {
        HandlerResult::Reject { requeue }
    }

    pub fn error(cause: impl Into<HandlerError>) -> Self {
        HandlerResult::Error(cause.into())
    }
}

impl<E: Into<HandlerError>> From<Result<(), E>> for HandlerResult {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => HandlerResult::Ack,
            Err(e) => HandlerResult::Error(e.into()),
        }
    }
}

/// User code invoked once per delivered message
pub trait Handler: Send {
    fn handle(&mut self, message: &Message) -> HandlerResult;
}

impl<F> Handler for F
where
    F: FnMut(&Message) -> HandlerResult + Send,
{
    fn handle(&mut self, message: &Message) -> HandlerResult {
        self(message)
    }
}

/// A handler failure forwarded to the consumer's error sink
#[derive(Debug)]
pub struct HandlerFailure {
    pub tag: DeliveryTag,
    pub routing_key: String,
    pub cause: HandlerError,
}

/// Receives handler failures; the consumer loop keeps running afterwards
pub trait ErrorSink: Send {
    fn report(&mut self, failure: &HandlerFailure);
}

impl<F> ErrorSink for F
where
    F: FnMut(&HandlerFailure) + Send,
{
    fn report(&mut self, failure: &HandlerFailure) {
        self(failure)
    }
}

/// Default sink: logs the failure
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&mut self, failure: &HandlerFailure) {
        error!(
            "Handler failed on delivery {} (routing key {}): {}",
            failure.tag, failure.routing_key, failure.cause
        );
    }
}
