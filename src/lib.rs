// ============================================================================
// Order Lifecycle
// ============================================================================
//
// Drives orders from Pending through settlement to Completed, and reclaims
// orders stuck in Processing as Expired. Two independent actors share one
// order store and one event channel:
//
//   intake ──Created──▶ processor ──Completed──▶ notifier
//                                                   ▲
//   sweeper (timer) ───────────────Expired──────────┘
//
// ============================================================================

pub mod config;
pub mod domain;
pub mod lifecycle;
pub mod messaging;
pub mod metrics;
pub mod runtime;
pub mod store;
pub mod utils;
