//! Message value objects and their wire encoding.
//!
//! The content type decides how a payload becomes bytes: JSON is written as
//! UTF-8 JSON text, text as UTF-8, and raw bytes pass through untouched.
//! Framing is left entirely to the transport.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

const MIME_JSON: &str = "application/json";
const MIME_TEXT: &str = "text/plain; charset=utf-8";
const MIME_BYTES: &str = "application/octet-stream";

/// How the message body is serialized on the wire
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Json,
    #[default]
    Bytes,
    Text,
}

impl ContentType {
    /// MIME type sent as the message's content-type property
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Json => MIME_JSON,
            ContentType::Text => MIME_TEXT,
            ContentType::Bytes => MIME_BYTES,
        }
    }

    /// Map a received content-type property back; unknown types are raw bytes
    pub fn from_mime(mime: Option<&str>) -> Self {
        let essence = mime
            .and_then(|m| m.split(';').next())
            .map(|m| m.trim().to_ascii_lowercase());
        match essence.as_deref() {
            Some("application/json") => ContentType::Json,
            Some(m) if m.starts_with("text/") => ContentType::Text,
            _ => ContentType::Bytes,
        }
    }
}

/// Whether the broker should persist the message on durable queues
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

impl DeliveryMode {
    /// AMQP delivery-mode property value
    pub fn as_amqp(&self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_amqp(value: Option<u8>) -> Self {
        match value {
            Some(2) => DeliveryMode::Persistent,
            _ => DeliveryMode::Transient,
        }
    }
}

/// Message body before encoding
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Bytes(Bytes),
    Json(serde_json::Value),
}

impl Payload {
    /// Serialize the payload according to `content_type`
    pub fn encode(&self, content_type: ContentType) -> Result<Bytes> {
        match (content_type, self) {
            (ContentType::Json, Payload::Json(value)) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| Error::Serialization(e.to_string())),
            (ContentType::Json, Payload::Text(text)) => {
                serde_json::from_str::<serde_json::Value>(text)
                    .map_err(|e| Error::Serialization(format!("text is not valid JSON: {}", e)))?;
                Ok(Bytes::copy_from_slice(text.as_bytes()))
            }
            (ContentType::Json, Payload::Bytes(raw)) => {
                serde_json::from_slice::<serde_json::Value>(raw)
                    .map_err(|e| Error::Serialization(format!("bytes are not valid JSON: {}", e)))?;
                Ok(raw.clone())
            }
            (ContentType::Text, Payload::Text(text)) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            (ContentType::Text, Payload::Bytes(raw)) => {
                std::str::from_utf8(raw)
                    .map_err(|e| Error::Serialization(format!("bytes are not UTF-8: {}", e)))?;
                Ok(raw.clone())
            }
            (ContentType::Text, Payload::Json(value)) => Ok(Bytes::from(value.to_string())),
            (ContentType::Bytes, Payload::Bytes(raw)) => Ok(raw.clone()),
            (ContentType::Bytes, Payload::Text(text)) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            (ContentType::Bytes, Payload::Json(value)) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| Error::Serialization(e.to_string())),
        }
    }

    /// Rebuild a payload from received bytes
    pub fn decode(body: Bytes, content_type: ContentType) -> Result<Self> {
        match content_type {
            ContentType::Json => serde_json::from_slice(&body)
                .map(Payload::Json)
                .map_err(|e| Error::Deserialization(e.to_string())),
            ContentType::Text => String::from_utf8(body.to_vec())
                .map(Payload::Text)
                .map_err(|e| Error::Deserialization(e.to_string())),
            ContentType::Bytes => Ok(Payload::Bytes(body)),
        }
    }
}

/// A message in the broker client layer
///
/// Messages are immutable once built; the chaining methods return new values.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    payload: Payload,
    content_type: ContentType,
    delivery_mode: DeliveryMode,
    routing_key: String,
    mandatory: bool,
    message_id: Option<String>,
}

impl Message {
    /// Create a new message with explicit content type
    pub fn new(payload: Payload, content_type: ContentType, routing_key: impl Into<String>) -> Self {
        Self {
            payload,
            content_type,
            delivery_mode: DeliveryMode::Transient,
            routing_key: routing_key.into(),
            mandatory: false,
            message_id: None,
        }
    }

    pub fn text(body: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self::new(Payload::Text(body.into()), ContentType::Text, routing_key)
    }

    pub fn bytes(body: impl Into<Bytes>, routing_key: impl Into<String>) -> Self {
        Self::new(Payload::Bytes(body.into()), ContentType::Bytes, routing_key)
    }

    pub fn json<T: Serialize>(body: &T, routing_key: impl Into<String>) -> Result<Self> {
        let value =
            serde_json::to_value(body).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Self::from_json_value(value, routing_key))
    }

    pub fn from_json_value(value: serde_json::Value, routing_key: impl Into<String>) -> Self {
        Self::new(Payload::Json(value), ContentType::Json, routing_key)
    }

    /// Ask the broker to persist this message
    pub fn persistent(mut self) -> Self {
        self.delivery_mode = DeliveryMode::Persistent;
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Fail the publish when no queue matches the routing key
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Encoded body as it goes on the wire
    pub fn encode(&self) -> Result<Bytes> {
        self.payload.encode(self.content_type)
    }

    /// The body as text, if it is text or valid UTF-8 bytes
    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            Payload::Bytes(raw) => std::str::from_utf8(raw).ok(),
            Payload::Json(_) => None,
        }
    }

    /// Deserialize a JSON body into `T`
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.payload {
            Payload::Json(value) => serde_json::from_value(value.clone())
                .map_err(|e| Error::Deserialization(e.to_string())),
            Payload::Text(text) => {
                serde_json::from_str(text).map_err(|e| Error::Deserialization(e.to_string()))
            }
            Payload::Bytes(raw) => {
                serde_json::from_slice(raw).map_err(|e| Error::Deserialization(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_encodes_as_utf8() {
        let message = Message::text("héllo", "q1");
        assert_eq!(message.encode().unwrap(), Bytes::from("héllo"));
        assert_eq!(message.content_type().mime(), "text/plain; charset=utf-8");
    }

    #[test]
    fn test_json_encodes_as_json_text() {
        let message = Message::json(&json!({"id": 7}), "q1").unwrap();
        assert_eq!(message.encode().unwrap(), Bytes::from(r#"{"id":7}"#));
        assert_eq!(message.json_body::<serde_json::Value>().unwrap()["id"], 7);
    }

    #[test]
    fn test_bytes_pass_through() {
        let raw = Bytes::from_static(&[0, 159, 146, 150]);
        let message = Message::bytes(raw.clone(), "q1");
        assert_eq!(message.encode().unwrap(), raw);
        assert!(message.as_text().is_none());
    }

    #[test]
    fn test_invalid_text_payload_is_rejected() {
        let message = Message::new(
            Payload::Bytes(Bytes::from_static(&[0xff, 0xfe])),
            ContentType::Text,
            "q1",
        );
        assert!(matches!(message.encode(), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_decode_by_content_type() {
        let payload = Payload::decode(Bytes::from(r#"[1,2]"#), ContentType::Json).unwrap();
        assert_eq!(payload, Payload::Json(json!([1, 2])));

        assert!(Payload::decode(Bytes::from("{nope"), ContentType::Json).is_err());
        assert!(Payload::decode(Bytes::from_static(&[0xff]), ContentType::Text).is_err());
    }

    #[test]
    fn test_mime_mapping() {
        assert_eq!(ContentType::from_mime(Some("application/json")), ContentType::Json);
        assert_eq!(ContentType::from_mime(Some("text/plain; charset=utf-8")), ContentType::Text);
        assert_eq!(ContentType::from_mime(Some("image/png")), ContentType::Bytes);
        assert_eq!(ContentType::from_mime(None), ContentType::Bytes);
    }

    #[test]
    fn test_builders_return_new_values() {
        let base = Message::text("x", "q1");
        let persistent = base.clone().persistent().mandatory();
        assert_eq!(base.delivery_mode(), DeliveryMode::Transient);
        assert!(!base.is_mandatory());
        assert_eq!(persistent.delivery_mode(), DeliveryMode::Persistent);
        assert!(persistent.is_mandatory());
    }
}
