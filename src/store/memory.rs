use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{NotificationLog, OrderStore, StoreError, TransitionOutcome};
use crate::domain::notification::Notification;
use crate::domain::order::{Order, OrderStatus};

// ============================================================================
// In-memory Order Store
// ============================================================================
//
// The write lock stands in for the row-level atomicity PostgreSQL gives the
// conditional UPDATE. Two hooks exist for exercising failure paths:
// `fail_next` makes the next N calls return `StoreError::Unavailable`, and
// `write_count` reports how many writes actually landed.
//
// ============================================================================

#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<Uuid, Order>>,
    injected_failures: AtomicU32,
    writes: AtomicU64,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` store calls fail as if the database were down
    pub fn fail_next(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes (upserts and applied transitions)
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        let consumed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        match consumed {
            Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        self.check_available()?;
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn find_by_status_older_than(
        &self,
        status: OrderStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError> {
        self.check_available()?;

        let mut matches: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.status == status && o.updated_at < older_than)
            .cloned()
            .collect();

        // Oldest first, same as the SQL backend
        matches.sort_by_key(|o| o.updated_at);
        Ok(matches)
    }

    async fn upsert(&self, order: &Order) -> Result<(), StoreError> {
        self.check_available()?;

        self.orders.write().await.insert(order.id, order.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(order_id = %order.id, status = %order.status, "Upserted order");
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        self.check_available()?;

        let mut orders = self.orders.write().await;
        let Some(order) = orders.get_mut(&id) else {
            return Ok(TransitionOutcome::NotFound);
        };

        if order.status != expected || !order.apply_transition(next, at) {
            return Ok(TransitionOutcome::Conflict {
                current: order.status,
            });
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(TransitionOutcome::Applied(order.clone()))
    }
}

// ============================================================================
// In-memory Notification Log
// ============================================================================

#[derive(Default)]
pub struct InMemoryNotificationLog {
    notifications: RwLock<Vec<Notification>>,
}

impl InMemoryNotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Notification> {
        self.notifications.read().await.clone()
    }
}

#[async_trait]
impl NotificationLog for InMemoryNotificationLog {
    async fn record_once(&self, notification: &Notification) -> Result<bool, StoreError> {
        let mut notifications = self.notifications.write().await;

        let duplicate = notifications
            .iter()
            .any(|n| n.order_id == notification.order_id && n.kind == notification.kind);
        if duplicate {
            return Ok(false);
        }

        notifications.push(notification.clone());
        Ok(true)
    }

    async fn for_order(&self, order_id: Uuid) -> Result<Vec<Notification>, StoreError> {
        Ok(self
            .notifications
            .read()
            .await
            .iter()
            .filter(|n| n.order_id == order_id)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
