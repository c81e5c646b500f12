// ============================================================================
// Runtime
// ============================================================================
//
// Process plumbing shared by every role:
// - shutdown   - one watch-backed signal for all loops
// - health     - component health registry behind /health
// - supervisor - spawns role tasks and stops them together
//
// ============================================================================

mod health;
mod shutdown;
mod supervisor;

pub use health::{ComponentHealth, HealthRegistry, HealthStatus, SystemHealth};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use supervisor::Supervisor;
