use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::order::{EventKind, LifecycleEvent, OrderError};

// ============================================================================
// Notification - audit record written by the lifecycle notifier
// ============================================================================

/// Longest message the notifications table accepts
pub const MAX_MESSAGE_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    OrderCompleted,
    OrderExpired,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::OrderCompleted => "OrderCompleted",
            NotificationKind::OrderExpired => "OrderExpired",
        }
    }

    pub fn for_event(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::Completed => Some(NotificationKind::OrderCompleted),
            EventKind::Expired => Some(NotificationKind::OrderExpired),
            EventKind::Created => None,
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OrderCompleted" => Ok(NotificationKind::OrderCompleted),
            "OrderExpired" => Ok(NotificationKind::OrderExpired),
            other => Err(OrderError::UnknownNotificationKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub order_id: Uuid,
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Build the audit record for a terminal lifecycle event. Created events
    /// produce no notification.
    pub fn from_event(event: &LifecycleEvent, expiration_minutes: i64) -> Option<Self> {
        let (kind, mut message) = match event {
            LifecycleEvent::Completed(e) => (
                NotificationKind::OrderCompleted,
                format!("Order {} completed successfully. Total: ${}", e.order_id, e.total),
            ),
            LifecycleEvent::Expired(e) => (
                NotificationKind::OrderExpired,
                format!(
                    "Order {} expired after {} minutes in Processing status",
                    e.order_id, expiration_minutes
                ),
            ),
            LifecycleEvent::Created(_) => return None,
        };
        message.truncate(MAX_MESSAGE_LEN);

        Some(Self {
            id: Uuid::new_v4(),
            order_id: event.order_id(),
            kind,
            message,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{OrderCompleted, OrderCreated, OrderExpired};
    use rust_decimal::Decimal;

    #[test]
    fn test_completed_notification_mentions_total() {
        let order_id = Uuid::new_v4();
        let event = LifecycleEvent::Completed(OrderCompleted {
            order_id,
            user_id: Uuid::new_v4(),
            total: Decimal::new(13000, 2),
            timestamp: Utc::now(),
        });

        let notification = Notification::from_event(&event, 10).unwrap();
        assert_eq!(notification.kind, NotificationKind::OrderCompleted);
        assert_eq!(notification.order_id, order_id);
        assert!(notification.message.ends_with("Total: $130.00"));
    }

    #[test]
    fn test_expired_notification_mentions_timeout() {
        let event = LifecycleEvent::Expired(OrderExpired {
            order_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        });

        let notification = Notification::from_event(&event, 10).unwrap();
        assert_eq!(notification.kind, NotificationKind::OrderExpired);
        assert!(notification.message.contains("after 10 minutes"));
    }

    #[test]
    fn test_created_event_has_no_notification() {
        let event = LifecycleEvent::Created(OrderCreated {
            order_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            total: Decimal::ZERO,
            timestamp: Utc::now(),
        });
        assert!(Notification::from_event(&event, 10).is_none());
        assert_eq!(NotificationKind::for_event(EventKind::Created), None);
    }
}
