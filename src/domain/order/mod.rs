// ============================================================================
// Order Domain
// ============================================================================
//
// Everything the lifecycle core knows about an order:
// - Value objects (OrderStatus and its transition table, OrderLine)
// - Events (Created, Completed, Expired)
// - Errors (OrderError)
// - Aggregate (Order)
//
// Persistence and transport live in `store` and `messaging`.
//
// ============================================================================

pub mod value_objects;
pub mod events;
pub mod errors;
pub mod aggregate;

pub use value_objects::*;
pub use events::*;
pub use errors::*;
pub use aggregate::*;
