//! Event envelope: the JSON document carried by every bus message.
//!
//! Outbound events are [`EventEnvelope`]s built by the publisher. Inbound
//! messages from peer services are decoded leniently into [`ReceivedEvent`]s:
//! only `event_type` is mandatory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::catalog::EventCatalog;

/// Event payload: a JSON object with arbitrary values.
pub type EventData = Map<String, Value>;

/// Content type of every message body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// An event as published by this service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_type: String,
    event_id: Uuid,
    timestamp: DateTime<Utc>,
    service: String,
    data: EventData,
}

impl EventEnvelope {
    /// Build an envelope with a fresh v4 id, stamped now.
    pub fn new(event_type: impl Into<String>, service: impl Into<String>, data: EventData) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            service: service.into(),
            data,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    /// Serialize to the UTF-8 JSON wire form.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Errors decoding an inbound message body.
#[derive(Debug, thiserror::Error)]
pub enum MessageDecodeError {
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Payload has no event_type")]
    MissingEventType,

    #[error("Payload data is not a JSON object")]
    DataNotObject,
}

#[derive(Deserialize)]
struct WireEvent {
    event_type: Option<String>,
    event_id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    service: Option<String>,
    #[serde(default)]
    data: Value,
}

/// An event received from the bus, as handed to subscription handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    pub event_type: String,
    /// Envelope id, or the message id property when the body has none.
    pub event_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Producing service, when the peer set it.
    pub service: Option<String>,
    pub data: EventData,
    pub routing_key: String,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
}

impl ReceivedEvent {
    /// Decode a message body.
    ///
    /// `message_id` is the AMQP message id property, used as the event id
    /// when the body does not carry one.
    pub fn decode(
        body: &[u8],
        routing_key: impl Into<String>,
        redelivered: bool,
        message_id: Option<&str>,
    ) -> Result<Self, MessageDecodeError> {
        let wire: WireEvent = serde_json::from_slice(body)?;

        let event_type = wire
            .event_type
            .filter(|t| !t.is_empty())
            .ok_or(MessageDecodeError::MissingEventType)?;

        let data = match wire.data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(MessageDecodeError::DataNotObject),
        };

        Ok(Self {
            event_type,
            event_id: wire.event_id.or_else(|| message_id.map(str::to_string)),
            timestamp: wire.timestamp,
            service: wire.service,
            data,
            routing_key: routing_key.into(),
            redelivered,
        })
    }

    /// Catalog description of this event type, if known.
    pub fn description(&self) -> Option<&'static str> {
        EventCatalog::describe(&self.event_type)
    }

    /// Look up a field of the payload.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> EventData {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_envelope_wire_fields() {
        let envelope = EventEnvelope::new(
            "product.created",
            "product-api",
            data(json!({"product_id": 7, "name": "Arabica"})),
        );
        let wire: Value = serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(wire["event_type"], "product.created");
        assert_eq!(wire["service"], "product-api");
        assert_eq!(wire["data"]["product_id"], 7);
        assert_eq!(wire["event_id"], envelope.event_id().to_string());
        let stamped: DateTime<Utc> = wire["timestamp"].as_str().unwrap().parse().unwrap();
        assert_eq!(stamped, envelope.timestamp());
    }

    #[test]
    fn test_envelope_ids_differ() {
        let a = EventEnvelope::new("product.updated", "product-api", EventData::new());
        let b = EventEnvelope::new("product.updated", "product-api", EventData::new());
        assert_ne!(a.event_id(), b.event_id());
    }

    #[test]
    fn test_decode_own_envelope() {
        let envelope = EventEnvelope::new(
            "product.deleted",
            "product-api",
            data(json!({"product_id": 3})),
        );
        let event =
            ReceivedEvent::decode(&envelope.to_json().unwrap(), "product.deleted", false, None)
                .unwrap();

        assert_eq!(event.event_type, "product.deleted");
        assert_eq!(event.service.as_deref(), Some("product-api"));
        assert_eq!(event.event_id, Some(envelope.event_id().to_string()));
        assert_eq!(event.timestamp, Some(envelope.timestamp()));
        assert_eq!(event.get("product_id"), Some(&json!(3)));
        assert_eq!(event.description(), Some("Product deleted"));
    }

    #[test]
    fn test_decode_python_style_timestamp() {
        let body = br#"{"event_type":"order.created","timestamp":"2024-05-01T10:00:00.123456+00:00","service":"order-api","data":{"order_id":42}}"#;
        let event = ReceivedEvent::decode(body, "order.created", true, Some("msg-1")).unwrap();

        assert!(event.timestamp.is_some());
        assert_eq!(event.event_id.as_deref(), Some("msg-1"));
        assert!(event.redelivered);
    }

    #[test]
    fn test_decode_missing_data_is_empty() {
        let event = ReceivedEvent::decode(br#"{"event_type":"customer.deleted"}"#, "customer.deleted", false, None)
            .unwrap();
        assert!(event.data.is_empty());
        assert!(event.service.is_none());
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let err = ReceivedEvent::decode(b"not json", "x.y", false, None).unwrap_err();
        assert!(matches!(err, MessageDecodeError::InvalidJson(_)));
    }

    #[test]
    fn test_decode_rejects_missing_event_type() {
        let err = ReceivedEvent::decode(br#"{"data":{}}"#, "x.y", false, None).unwrap_err();
        assert!(matches!(err, MessageDecodeError::MissingEventType));

        let err = ReceivedEvent::decode(br#"{"event_type":""}"#, "x.y", false, None).unwrap_err();
        assert!(matches!(err, MessageDecodeError::MissingEventType));
    }

    #[test]
    fn test_decode_rejects_scalar_data() {
        let err = ReceivedEvent::decode(br#"{"event_type":"a.b","data":5}"#, "a.b", false, None)
            .unwrap_err();
        assert!(matches!(err, MessageDecodeError::DataNotObject));
    }
}
