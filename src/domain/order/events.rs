use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::aggregate::Order;

// ============================================================================
// Order Lifecycle Events
// ============================================================================
//
// Each variant travels on its own topic. The payload on the wire is the bare
// variant struct in camelCase; the enum tag is only used when events are
// stored or logged as a whole.
//
// ============================================================================

/// The three message kinds carried by the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Completed,
    Expired,
}

impl EventKind {
    /// Name used for dedup keys and metric labels
    pub fn event_type(self) -> &'static str {
        match self {
            EventKind::Created => "OrderCreated",
            EventKind::Completed => "OrderCompleted",
            EventKind::Expired => "OrderExpired",
        }
    }

    /// Topic name without the deployment prefix
    pub fn topic_suffix(self) -> &'static str {
        match self {
            EventKind::Created => "order-created",
            EventKind::Completed => "order-completed",
            EventKind::Expired => "order-expired",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type())
    }
}

/// Order Created - emitted by intake once the `Pending` order is durable
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub total: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Order Completed - settlement succeeded
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderCompleted {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub total: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Order Expired - reclaimed by the sweeper
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderExpired {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LifecycleEvent {
    Created(OrderCreated),
    Completed(OrderCompleted),
    Expired(OrderExpired),
}

impl LifecycleEvent {
    pub fn created(order: &Order) -> Self {
        LifecycleEvent::Created(OrderCreated {
            order_id: order.id,
            user_id: order.user_id,
            total: order.total,
            timestamp: order.created_at,
        })
    }

    /// Built from the order as persisted by the `Completed` transition, so
    /// the timestamp is the stored `updated_at`.
    pub fn completed(order: &Order) -> Self {
        LifecycleEvent::Completed(OrderCompleted {
            order_id: order.id,
            user_id: order.user_id,
            total: order.total,
            timestamp: order.updated_at,
        })
    }

    pub fn expired(order: &Order) -> Self {
        LifecycleEvent::Expired(OrderExpired {
            order_id: order.id,
            user_id: order.user_id,
            timestamp: order.updated_at,
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Created(_) => EventKind::Created,
            LifecycleEvent::Completed(_) => EventKind::Completed,
            LifecycleEvent::Expired(_) => EventKind::Expired,
        }
    }

    pub fn order_id(&self) -> Uuid {
        match self {
            LifecycleEvent::Created(e) => e.order_id,
            LifecycleEvent::Completed(e) => e.order_id,
            LifecycleEvent::Expired(e) => e.order_id,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            LifecycleEvent::Created(e) => e.user_id,
            LifecycleEvent::Completed(e) => e.user_id,
            LifecycleEvent::Expired(e) => e.user_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LifecycleEvent::Created(e) => e.timestamp,
            LifecycleEvent::Completed(e) => e.timestamp,
            LifecycleEvent::Expired(e) => e.timestamp,
        }
    }

    /// Serialize the bare variant payload for the wire
    pub fn encode_payload(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            LifecycleEvent::Created(e) => serde_json::to_vec(e),
            LifecycleEvent::Completed(e) => serde_json::to_vec(e),
            LifecycleEvent::Expired(e) => serde_json::to_vec(e),
        }
    }

    /// Decode a wire payload; the kind comes from the topic it arrived on
    pub fn decode_payload(kind: EventKind, payload: &[u8]) -> serde_json::Result<Self> {
        Ok(match kind {
            EventKind::Created => LifecycleEvent::Created(serde_json::from_slice(payload)?),
            EventKind::Completed => LifecycleEvent::Completed(serde_json::from_slice(payload)?),
            EventKind::Expired => LifecycleEvent::Expired(serde_json::from_slice(payload)?),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
