use crate::error::{Error, Result};
use crate::message::{ContentType, Message, Payload};
use crate::transport::{DeliveryTag, RawDelivery};
use crate::ConnectionId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Single-use token for acknowledging one delivery.
///
/// Clones share the resolved flag, so a delivery can be resolved once no
/// matter which clone is used.
#[derive(Debug, Clone)]
pub struct AckHandle {
    tag: DeliveryTag,
    connection: ConnectionId,
    resolved: Arc<AtomicBool>,
}

impl AckHandle {
    pub(crate) fn new(tag: DeliveryTag, connection: ConnectionId) -> Self {
        Self {
            tag,
            connection,
            resolved: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    pub(crate) fn mark_resolved(&self) -> Result<()> {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyResolved(self.tag));
        }
        Ok(())
    }
}

/// One message as received by a consumer, paired with its ack handle
#[derive(Debug)]
pub struct Delivery {
    pub message: Message,
    pub ack_handle: AckHandle,
    pub routing_key: String,
    pub exchange: String,
    pub redelivered: bool,
    /// Number of earlier deliveries of this message
    pub delivery_count: u32,
}

impl Delivery {
    /// Decode a raw delivery; on failure the ack handle is returned so the
    /// caller can still resolve it
    pub(crate) fn from_raw(
        raw: RawDelivery,
        connection: ConnectionId,
    ) -> std::result::Result<Self, (AckHandle, Error)> {
        let ack_handle = AckHandle::new(raw.tag, connection);
        let content_type = ContentType::from_mime(raw.content_type.as_deref());

        let payload = match Payload::decode(raw.body, content_type) {
            Ok(payload) => payload,
            Err(e) => return Err((ack_handle, e)),
        };

        let mut message = Message::new(payload, content_type, raw.routing_key.clone())
            .with_delivery_mode(raw.delivery_mode);
        if let Some(id) = raw.message_id {
            message = message.with_message_id(id);
        }

        Ok(Self {
            message,
            ack_handle,
            routing_key: raw.routing_key,
            exchange: raw.exchange,
            redelivered: raw.redelivered,
            delivery_count: raw.delivery_count,
        })
    }
}
