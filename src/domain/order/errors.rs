use rust_decimal::Decimal;

// ============================================================================
// Order Business Rule Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order must contain at least one line")]
    EmptyLines,

    #[error("Invalid quantity on line {line_no}: {quantity}")]
    InvalidQuantity { line_no: i32, quantity: i32 },

    #[error("Negative unit price on line {line_no}: {price}")]
    NegativePrice { line_no: i32, price: Decimal },

    #[error("Unit price on line {line_no} has more than two decimal places: {price}")]
    PriceScale { line_no: i32, price: Decimal },

    #[error("Order total out of range at line {line_no}")]
    TotalOverflow { line_no: i32 },

    #[error("Unknown order status: {0}")]
    UnknownStatus(String),

    #[error("Unknown notification kind: {0}")]
    UnknownNotificationKind(String),

    #[error("Malformed line '{0}', expected <product>:<quantity>:<price>")]
    MalformedLine(String),
}
