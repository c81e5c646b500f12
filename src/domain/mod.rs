// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Order aggregate, its state machine, the lifecycle events it produces, and
// the audit notifications derived from those events.
// This layer knows nothing about databases, brokers or tasks.
//
// ============================================================================

pub mod order;
pub mod notification;
