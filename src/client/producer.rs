use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::{Connection, Envelope};
use crate::MAX_NAME_LENGTH;
use tracing::{debug, error};

/// Publishes messages to one exchange over a borrowed connection
#[derive(Debug, Clone, Default)]
pub struct Producer {
    exchange: String,
}

impl Producer {
    /// A producer for the default exchange, which routes by queue name
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_exchange(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publish a single message; returns once the transport accepted the write
    pub fn publish(&self, connection: &mut Connection, message: &Message) -> Result<()> {
        if message.routing_key().len() > MAX_NAME_LENGTH {
            return Err(Error::NameTooLong);
        }
        let body = message.encode()?;

        debug!(
            "Publishing message to exchange '{}' with routing key {} (size: {} bytes)",
            self.exchange,
            message.routing_key(),
            body.len()
        );

        connection.publish(Envelope {
            exchange: self.exchange.clone(),
            routing_key: message.routing_key().to_string(),
            body,
            content_type: message.content_type(),
            delivery_mode: message.delivery_mode(),
            mandatory: message.is_mandatory(),
            message_id: message.message_id().map(str::to_string),
        })
    }

    /// Publish messages in order, stopping at the first failure
    pub fn publish_batch(&self, connection: &mut Connection, messages: &[Message]) -> Result<usize> {
        debug!("Publishing batch of {} messages", messages.len());
        for (sent, message) in messages.iter().enumerate() {
            if let Err(e) = self.publish(connection, message) {
                error!(
                    "Batch publish stopped after {} of {} messages: {}",
                    sent,
                    messages.len(),
                    e
                );
                return Err(e);
            }
        }
        Ok(messages.len())
    }
}
