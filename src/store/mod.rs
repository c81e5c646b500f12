// ============================================================================
// Order Store
// ============================================================================
//
// Single source of truth for order state, shared by the lifecycle processor
// and the expiration sweeper. Those two actors may run in different processes
// and never coordinate in memory, so every status change goes through
// `transition`, a conditional write keyed by order id and expected prior
// status. First write wins; the loser gets `TransitionOutcome::Conflict`.
//
// Backends:
// - memory   - in-process, used by tests and single-process runs
// - postgres - sqlx/PostgreSQL
//
// ============================================================================

mod memory;
mod postgres;

pub use memory::{InMemoryNotificationLog, InMemoryOrderStore};
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::notification::Notification;
use crate::domain::order::{Order, OrderStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row for order {order_id}: {reason}")]
    CorruptRow { order_id: Uuid, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result of a conditional status write
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The precondition held; carries the order as persisted
    Applied(Order),
    /// The order exists but is not in the expected status, or the move is not
    /// in the transition table. Nothing was written.
    Conflict { current: OrderStatus },
    /// No order with that id
    NotFound,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>, StoreError>;

    /// All orders in `status` whose `updated_at` is strictly before `older_than`
    async fn find_by_status_older_than(
        &self,
        status: OrderStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError>;

    /// Insert or replace an order together with its lines. Only the intake
    /// path writes through here; lifecycle moves use `transition`.
    async fn upsert(&self, order: &Order) -> Result<(), StoreError>;

    /// Atomically move `id` from `expected` to `next`, stamping `at`.
    async fn transition(
        &self,
        id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;
}

/// Audit log written by the lifecycle notifier
#[async_trait]
pub trait NotificationLog: Send + Sync {
    /// Record `notification` unless one with the same order id and kind is
    /// already stored. Returns whether a row was written.
    async fn record_once(&self, notification: &Notification) -> Result<bool, StoreError>;

    async fn for_order(&self, order_id: Uuid) -> Result<Vec<Notification>, StoreError>;
}
