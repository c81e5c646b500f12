use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::OrderError;
use super::value_objects::{LineRequest, OrderLine, OrderStatus};

/// Fractional digits kept for money, matching the `NUMERIC(18, 2)` columns
const MONEY_SCALE: u32 = 2;

/// Exclusive upper bound of a `NUMERIC(18, 2)` amount
fn money_limit() -> Decimal {
    Decimal::from(10_000_000_000_000_000_i64)
}

// ============================================================================
// Order Aggregate
// ============================================================================
//
// The order is mutated in place by two independent actors (the lifecycle
// processor and the expiration sweeper). Lines and total are fixed when the
// order is placed; lifecycle transitions only touch `status` and `updated_at`.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    // Identity
    pub id: Uuid,
    pub user_id: Uuid,

    // Current State
    pub total: Decimal,
    pub status: OrderStatus,
    pub lines: Vec<OrderLine>,

    // Audit Trail
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Build a new `Pending` order, numbering the lines and computing the
    /// total from them.
    pub fn place(
        user_id: Uuid,
        lines: Vec<LineRequest>,
        now: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        let lines = Self::validate_lines(lines)?;
        let total = Self::sum_lines(&lines)?;

        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            total,
            status: OrderStatus::Pending,
            lines,
            created_at: now,
            updated_at: now,
        })
    }

    /// Validate business rules and assign 1-based line numbers
    fn validate_lines(lines: Vec<LineRequest>) -> Result<Vec<OrderLine>, OrderError> {
        if lines.is_empty() {
            return Err(OrderError::EmptyLines);
        }

        lines
            .into_iter()
            .zip(1..)
            .map(|(line, line_no)| {
                if line.quantity <= 0 {
                    return Err(OrderError::InvalidQuantity {
                        line_no,
                        quantity: line.quantity,
                    });
                }
                if line.unit_price < Decimal::ZERO {
                    return Err(OrderError::NegativePrice {
                        line_no,
                        price: line.unit_price,
                    });
                }
                if line.unit_price.normalize().scale() > MONEY_SCALE {
                    return Err(OrderError::PriceScale {
                        line_no,
                        price: line.unit_price,
                    });
                }

                Ok(OrderLine {
                    line_no,
                    product_id: line.product_id,
                    quantity: line.quantity,
                    unit_price: line.unit_price,
                })
            })
            .collect()
    }

    /// Sum of the line subtotals. Fails on the first line that pushes the
    /// total past what a `NUMERIC(18, 2)` column holds.
    pub fn sum_lines(lines: &[OrderLine]) -> Result<Decimal, OrderError> {
        let limit = money_limit();
        lines.iter().try_fold(Decimal::ZERO, |total, line| {
            line.subtotal()
                .and_then(|subtotal| total.checked_add(subtotal))
                .filter(|total| *total < limit)
                .ok_or(OrderError::TotalOverflow {
                    line_no: line.line_no,
                })
        })
    }

    /// Apply a lifecycle transition in place.
    ///
    /// Returns `false` and leaves the order untouched when the table in
    /// [`OrderStatus::can_transition_to`] does not allow the move. Stores call
    /// this only after checking the expected prior status, so a `false` here
    /// means the caller asked for an undefined edge.
    pub fn apply_transition(&mut self, next: OrderStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }

        self.status = next;
        self.updated_at = at;
        true
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
