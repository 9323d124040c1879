//! Reactions of the product service to events from peer services.

use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use tracing::info;

use crate::bus::{EventHandler, HandlerResult};
use crate::catalog::{CUSTOMER_CREATED, ORDER_CANCELLED, ORDER_CREATED};
use crate::envelope::ReceivedEvent;

/// Logs every peer event with its source service and catalog description,
/// plus the identifier relevant to the event type.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerEventLogger;

impl PeerEventLogger {
    pub fn new() -> Self {
        Self
    }

    /// Payload field worth surfacing for an event type, if any.
    pub fn key_field(event_type: &str) -> Option<&'static str> {
        match event_type {
            CUSTOMER_CREATED => Some("customer_id"),
            ORDER_CREATED => Some("order_data"),
            ORDER_CANCELLED => Some("order_id"),
            _ => None,
        }
    }
}

impl EventHandler for PeerEventLogger {
    fn handle(&self, event: Arc<ReceivedEvent>) -> BoxFuture<'static, HandlerResult> {
        info!(
            event_type = %event.event_type,
            source = event.service.as_deref().unwrap_or("unknown"),
            description = event.description().unwrap_or("uncatalogued"),
            "Peer event received"
        );

        if let Some(field) = Self::key_field(&event.event_type) {
            let value = event.get(field).map_or_else(|| "-".to_string(), render);
            info!(event_type = %event.event_type, field, value = %value, "Peer event detail");
        }

        future::ready(Ok(())).boxed()
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_fields() {
        assert_eq!(PeerEventLogger::key_field(CUSTOMER_CREATED), Some("customer_id"));
        assert_eq!(PeerEventLogger::key_field(ORDER_CREATED), Some("order_data"));
        assert_eq!(PeerEventLogger::key_field(ORDER_CANCELLED), Some("order_id"));
        assert_eq!(PeerEventLogger::key_field("order.shipped"), None);
    }

    #[tokio::test]
    async fn test_never_fails() {
        let event = ReceivedEvent::decode(
            br#"{"event_type":"order.cancelled","service":"order-api","data":{"order_id":"o-1"}}"#,
            "order.cancelled",
            false,
            None,
        )
        .unwrap();
        assert!(PeerEventLogger::new().handle(Arc::new(event)).await.is_ok());
    }
}
