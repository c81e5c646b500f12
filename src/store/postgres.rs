use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use uuid::Uuid;

use super::{NotificationLog, OrderStore, StoreError, TransitionOutcome};
use crate::domain::notification::{Notification, NotificationKind};
use crate::domain::order::{Order, OrderLine, OrderStatus};

// ============================================================================
// PostgreSQL Order Store
// ============================================================================
//
// Status changes are a single `UPDATE ... WHERE id = $1 AND status = $2`, so
// concurrent actors in different processes cannot lose each other's writes.
// When the update matches no row we read the current status back to tell a
// conflict from a missing order.
//
// ============================================================================

const SCHEMA: &str = include_str!("../../migrations/0001_order_lifecycle.sql");

const ORDER_COLUMNS: &str = "id, user_id, total, status, created_at, updated_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Apply the bundled schema. Every statement is idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::info!("Applied order lifecycle schema");
        Ok(())
    }

    fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
        let id: Uuid = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let status = status.parse::<OrderStatus>().map_err(|e| StoreError::CorruptRow {
            order_id: id,
            reason: e.to_string(),
        })?;

        Ok(Order {
            id,
            user_id: row.try_get("user_id")?,
            total: row.try_get::<Decimal, _>("total")?,
            status,
            lines: Vec::new(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Load lines for a set of orders in one round trip
    async fn load_lines(&self, order_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<OrderLine>>, StoreError> {
        let rows = sqlx::query(
            "SELECT order_id, line_no, product_id, quantity, unit_price
             FROM order_lines
             WHERE order_id = ANY($1)
             ORDER BY order_id, line_no",
        )
        .bind(order_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut lines: HashMap<Uuid, Vec<OrderLine>> = HashMap::new();
        for row in rows {
            let order_id: Uuid = row.try_get("order_id")?;
            lines.entry(order_id).or_default().push(OrderLine {
                line_no: row.try_get("line_no")?,
                product_id: row.try_get("product_id")?,
                quantity: row.try_get("quantity")?,
                unit_price: row.try_get("unit_price")?,
            });
        }

        Ok(lines)
    }

    async fn hydrate(&self, mut orders: Vec<Order>) -> Result<Vec<Order>, StoreError> {
        if orders.is_empty() {
            return Ok(orders);
        }

        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let mut lines = self.load_lines(&ids).await?;
        for order in &mut orders {
            order.lines = lines.remove(&order.id).unwrap_or_default();
        }

        Ok(orders)
    }

    async fn current_status(&self, id: Uuid) -> Result<Option<OrderStatus>, StoreError> {
        let row = sqlx::query("SELECT status FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<OrderStatus, StoreError> {
            let status: String = row.try_get("status")?;
            status.parse::<OrderStatus>().map_err(|e| StoreError::CorruptRow {
                order_id: id,
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    async fn conflict_or_missing(&self, id: Uuid) -> Result<TransitionOutcome, StoreError> {
        Ok(match self.current_status(id).await? {
            Some(current) => TransitionOutcome::Conflict { current },
            None => TransitionOutcome::NotFound,
        })
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let order = Self::order_from_row(&row)?;
        Ok(self.hydrate(vec![order]).await?.pop())
    }

    async fn find_by_status_older_than(
        &self,
        status: OrderStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE status = $1 AND updated_at < $2
             ORDER BY updated_at ASC"
        ))
        .bind(status.as_str())
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        let orders = rows
            .iter()
            .map(Self::order_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        self.hydrate(orders).await
    }

    async fn upsert(&self, order: &Order) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO orders (id, user_id, total, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET
                 user_id = EXCLUDED.user_id,
                 total = EXCLUDED.total,
                 status = EXCLUDED.status,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(order.id)
        .bind(order.user_id)
        .bind(order.total)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM order_lines WHERE order_id = $1")
            .bind(order.id)
            .execute(&mut *tx)
            .await?;

        for line in &order.lines {
            sqlx::query(
                "INSERT INTO order_lines (order_id, line_no, product_id, quantity, unit_price)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(order.id)
            .bind(line.line_no)
            .bind(line.product_id)
            .bind(line.quantity)
            .bind(line.unit_price)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            order_id = %order.id,
            status = %order.status,
            line_count = order.lines.len(),
            "Upserted order"
        );
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        if !expected.can_transition_to(next) {
            return self.conflict_or_missing(id).await;
        }

        let row = sqlx::query(&format!(
            "UPDATE orders SET status = $3, updated_at = $4
             WHERE id = $1 AND status = $2
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let order = Self::order_from_row(&row)?;
                let order = self.hydrate(vec![order]).await?.pop().ok_or_else(|| {
                    StoreError::CorruptRow {
                        order_id: id,
                        reason: "order vanished after update".to_string(),
                    }
                })?;
                Ok(TransitionOutcome::Applied(order))
            }
            None => self.conflict_or_missing(id).await,
        }
    }
}

#[async_trait]
impl NotificationLog for PgStore {
    async fn record_once(&self, notification: &Notification) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO notifications (id, order_id, kind, message, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (order_id, kind) DO NOTHING",
        )
        .bind(notification.id)
        .bind(notification.order_id)
        .bind(notification.kind.as_str())
        .bind(&notification.message)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn for_order(&self, order_id: Uuid) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, order_id, kind, message, created_at
             FROM notifications WHERE order_id = $1
             ORDER BY created_at ASC",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Notification, StoreError> {
                let kind: String = row.try_get("kind")?;
                Ok(Notification {
                    id: row.try_get("id")?,
                    order_id: row.try_get("order_id")?,
                    kind: kind.parse::<NotificationKind>().map_err(|e| StoreError::CorruptRow {
                        order_id,
                        reason: e.to_string(),
                    })?,
                    message: row.try_get("message")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
