//! Catalog of event types exchanged with peer services.
//!
//! Purely descriptive: used for log lines and introspection. Nothing at
//! runtime branches on whether an event type is catalogued.

// Events this service publishes.
pub const PRODUCT_CREATED: &str = "product.created";
pub const PRODUCT_UPDATED: &str = "product.updated";
pub const PRODUCT_DELETED: &str = "product.deleted";

// Events published by the customers service.
pub const CUSTOMER_CREATED: &str = "customer.created";
pub const CUSTOMER_UPDATED: &str = "customer.updated";
pub const CUSTOMER_DELETED: &str = "customer.deleted";

// Events published by the orders service.
pub const ORDER_CREATED: &str = "order.created";
pub const ORDER_UPDATED: &str = "order.updated";
pub const ORDER_CANCELLED: &str = "order.cancelled";
pub const ORDER_SHIPPED: &str = "order.shipped";
pub const ORDER_DELIVERED: &str = "order.delivered";

/// Which side of the bus an event type sits on for this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDirection {
    /// Published by this service.
    Emitted,
    /// Published by a peer and consumed here.
    Consumed,
}

/// A catalogued event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDescriptor {
    pub event_type: &'static str,
    pub description: &'static str,
    pub direction: EventDirection,
}

const fn emitted(event_type: &'static str, description: &'static str) -> EventDescriptor {
    EventDescriptor {
        event_type,
        description,
        direction: EventDirection::Emitted,
    }
}

const fn consumed(event_type: &'static str, description: &'static str) -> EventDescriptor {
    EventDescriptor {
        event_type,
        description,
        direction: EventDirection::Consumed,
    }
}

const CATALOG: &[EventDescriptor] = &[
    emitted(PRODUCT_CREATED, "New product created"),
    emitted(PRODUCT_UPDATED, "Product updated"),
    emitted(PRODUCT_DELETED, "Product deleted"),
    consumed(CUSTOMER_CREATED, "New customer created"),
    consumed(CUSTOMER_UPDATED, "Customer updated"),
    consumed(CUSTOMER_DELETED, "Customer deleted"),
    consumed(ORDER_CREATED, "New order created"),
    consumed(ORDER_UPDATED, "Order updated"),
    consumed(ORDER_CANCELLED, "Order cancelled"),
    consumed(ORDER_SHIPPED, "Order shipped"),
    consumed(ORDER_DELIVERED, "Order delivered"),
];

/// Patterns the product service binds at startup.
const DEFAULT_SUBSCRIPTIONS: &[&str] = &[
    CUSTOMER_CREATED,
    CUSTOMER_UPDATED,
    CUSTOMER_DELETED,
    ORDER_CREATED,
    ORDER_UPDATED,
    ORDER_CANCELLED,
];

/// Read-only view over the static event catalog.
pub struct EventCatalog;

impl EventCatalog {
    /// Every catalogued event type.
    pub fn all() -> &'static [EventDescriptor] {
        CATALOG
    }

    pub fn lookup(event_type: &str) -> Option<&'static EventDescriptor> {
        CATALOG.iter().find(|d| d.event_type == event_type)
    }

    /// Human-readable description of an event type, if catalogued.
    pub fn describe(event_type: &str) -> Option<&'static str> {
        Self::lookup(event_type).map(|d| d.description)
    }

    pub fn is_known(event_type: &str) -> bool {
        Self::lookup(event_type).is_some()
    }

    pub fn emitted() -> impl Iterator<Item = &'static EventDescriptor> {
        CATALOG
            .iter()
            .filter(|d| d.direction == EventDirection::Emitted)
    }

    pub fn consumed() -> impl Iterator<Item = &'static EventDescriptor> {
        CATALOG
            .iter()
            .filter(|d| d.direction == EventDirection::Consumed)
    }

    /// Binding patterns used by the service's startup subscription.
    pub fn default_subscriptions() -> &'static [&'static str] {
        DEFAULT_SUBSCRIPTIONS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_describe_known_and_unknown() {
        assert_eq!(
            EventCatalog::describe(PRODUCT_CREATED),
            Some("New product created")
        );
        assert_eq!(EventCatalog::describe("invoice.paid"), None);
        assert!(!EventCatalog::is_known("invoice.paid"));
    }

    #[test]
    fn test_event_types_are_unique_and_namespaced() {
        let types: HashSet<_> = EventCatalog::all().iter().map(|d| d.event_type).collect();
        assert_eq!(types.len(), EventCatalog::all().len());
        for event_type in types {
            assert_eq!(event_type.split('.').count(), 2, "{}", event_type);
        }
    }

    #[test]
    fn test_directions() {
        let emitted: Vec<_> = EventCatalog::emitted().map(|d| d.event_type).collect();
        assert_eq!(emitted, vec![PRODUCT_CREATED, PRODUCT_UPDATED, PRODUCT_DELETED]);
        assert_eq!(EventCatalog::consumed().count(), 8);
    }

    #[test]
    fn test_default_subscriptions_are_consumed_events() {
        for pattern in EventCatalog::default_subscriptions() {
            let descriptor = EventCatalog::lookup(pattern).unwrap();
            assert_eq!(descriptor.direction, EventDirection::Consumed);
        }
    }
}
