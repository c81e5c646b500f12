use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::errors::OrderError;

// ============================================================================
// Order Value Objects
// ============================================================================

/// Lifecycle status of an order.
///
/// `Completed` and `Expired` are terminal. Stored as text in the database and
/// rendered in PascalCase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Expired,
}

impl OrderStatus {
    /// Transition table recognized by the lifecycle core.
    ///
    /// Anything not listed here, including every move out of a terminal
    /// state, is rejected by the stores as a conflict rather than an error.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Processing)
                | (OrderStatus::Processing, OrderStatus::Completed)
                | (OrderStatus::Processing, OrderStatus::Expired)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::Processing => "Processing",
            OrderStatus::Completed => "Completed",
            OrderStatus::Expired => "Expired",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(OrderStatus::Pending),
            "Processing" => Ok(OrderStatus::Processing),
            "Completed" => Ok(OrderStatus::Completed),
            "Expired" => Ok(OrderStatus::Expired),
            other => Err(OrderError::UnknownStatus(other.to_string())),
        }
    }
}

/// A line as requested by the caller, before it is attached to an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineRequest {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl LineRequest {
    pub fn new(product_id: Uuid, quantity: i32, unit_price: Decimal) -> Self {
        Self {
            product_id,
            quantity,
            unit_price,
        }
    }
}

/// Parses `<product-uuid>:<quantity>:<unit-price>`, the shape the
/// `place-order` subcommand accepts.
impl FromStr for LineRequest {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || OrderError::MalformedLine(s.to_string());

        let mut parts = s.split(':');
        let (Some(product), Some(quantity), Some(price), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };

        Ok(Self {
            product_id: product.trim().parse().map_err(|_| malformed())?,
            quantity: quantity.trim().parse().map_err(|_| malformed())?,
            unit_price: price.trim().parse().map_err(|_| malformed())?,
        })
    }
}

/// A line item owned by an order. `line_no` is 1-based and sequential within
/// the order; the unit price is captured when the order is placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub line_no: i32,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl OrderLine {
    /// `None` when the product does not fit in a `Decimal`
    pub fn subtotal(&self) -> Option<Decimal> {
        self.unit_price.checked_mul(Decimal::from(self.quantity))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
