//! Event publishing on the shared topic exchange.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::routing::validate_routing_key;
use super::{ConnectionManager, ConnectionState, PublishError};
use crate::envelope::{EventData, EventEnvelope, CONTENT_TYPE_JSON};
use crate::transport::MessageProperties;

/// Builds event envelopes and sends them keyed by event type.
///
/// At-most-once: a send is not retried and broker confirms are not awaited.
#[derive(Clone)]
pub struct EventPublisher {
    manager: ConnectionManager,
}

impl EventPublisher {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Publish `data` as an event of `event_type`.
    ///
    /// The event type is the routing key, verbatim. Returns the envelope that
    /// went on the wire.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(event_type = %event_type))]
    pub async fn publish(
        &self,
        event_type: &str,
        data: EventData,
    ) -> Result<EventEnvelope, PublishError> {
        if !self.manager.is_connected() {
            return Err(match self.manager.state() {
                ConnectionState::Closed => PublishError::ConnectionClosed,
                _ => PublishError::NotConnected,
            });
        }
        validate_routing_key(event_type).map_err(|reason| PublishError::InvalidEventType {
            event_type: event_type.to_string(),
            reason,
        })?;

        let service = &self.manager.config().service_name;
        let envelope = EventEnvelope::new(event_type, service.as_str(), data);
        let body = envelope.to_json()?;
        let properties = MessageProperties {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            persistent: true,
            message_id: Some(envelope.event_id().to_string()),
            timestamp: u64::try_from(envelope.timestamp().timestamp()).ok(),
            app_id: Some(service.clone()),
        };

        self.manager.send(event_type, &body, &properties).await?;

        debug!(
            event_id = %envelope.event_id(),
            exchange = %self.manager.exchange(),
            "Published event"
        );
        Ok(envelope)
    }

    /// Publish any serializable payload. It must serialize to a JSON object.
    pub async fn publish_json<T>(
        &self,
        event_type: &str,
        payload: &T,
    ) -> Result<EventEnvelope, PublishError>
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_value(payload)? {
            Value::Object(data) => self.publish(event_type, data).await,
            _ => Err(PublishError::PayloadNotObject),
        }
    }

    /// Publish without failing the caller. Logs and returns `false` when the
    /// event did not go out.
    pub async fn publish_or_log(&self, event_type: &str, data: EventData) -> bool {
        match self.publish(event_type, data).await {
            Ok(_) => true,
            Err(PublishError::NotConnected) => {
                warn!(event_type = %event_type, "Broker not connected, event not published");
                false
            }
            Err(e) => {
                warn!(event_type = %event_type, error = %e, "Failed to publish event");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::transport::InMemoryBroker;
    use serde_json::json;
    use std::sync::Arc;

    async fn connected(broker: &InMemoryBroker) -> EventPublisher {
        let manager = ConnectionManager::new(BrokerConfig::default(), Arc::new(broker.clone()));
        manager.connect().await.unwrap();
        EventPublisher::new(manager)
    }

    #[derive(Serialize)]
    struct ProductCreated {
        product_id: u64,
        name: &'static str,
    }

    #[tokio::test]
    async fn test_publish_sets_properties() {
        let broker = InMemoryBroker::new();
        let publisher = connected(&broker).await;

        let envelope = publisher
            .publish_json(
                "product.created",
                &ProductCreated {
                    product_id: 7,
                    name: "Arabica",
                },
            )
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        let message = &published[0];
        assert_eq!(message.exchange, "payetonkawa.events");
        assert_eq!(message.routing_key, "product.created");
        assert_eq!(
            message.properties.content_type.as_deref(),
            Some("application/json")
        );
        assert!(message.properties.persistent);
        assert_eq!(
            message.properties.message_id,
            Some(envelope.event_id().to_string())
        );
        assert_eq!(message.properties.app_id.as_deref(), Some("product-api"));

        let body: Value = serde_json::from_slice(&message.body).unwrap();
        assert_eq!(body["data"], json!({"product_id": 7, "name": "Arabica"}));
    }

    #[tokio::test]
    async fn test_publish_json_rejects_non_object() {
        let broker = InMemoryBroker::new();
        let publisher = connected(&broker).await;

        let err = publisher
            .publish_json("product.updated", &[1, 2, 3])
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::PayloadNotObject));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_rejects_empty_event_type() {
        let broker = InMemoryBroker::new();
        let publisher = connected(&broker).await;

        let err = publisher.publish("", EventData::new()).await.unwrap_err();
        assert!(matches!(err, PublishError::InvalidEventType { .. }));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_keeps_unusual_event_types_verbatim() {
        let broker = InMemoryBroker::new();
        let publisher = connected(&broker).await;

        publisher
            .publish("order..created", EventData::new())
            .await
            .unwrap();
        assert_eq!(broker.published()[0].routing_key, "order..created");

        let err = publisher
            .publish(&"a".repeat(256), EventData::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::InvalidEventType { .. }));
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_or_log_reports_outcome() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(BrokerConfig::default(), Arc::new(broker.clone()));
        let publisher = EventPublisher::new(manager.clone());

        assert!(!publisher.publish_or_log("product.deleted", EventData::new()).await);

        manager.connect().await.unwrap();
        assert!(publisher.publish_or_log("product.deleted", EventData::new()).await);
        assert_eq!(broker.published().len(), 1);
    }
}
