// ============================================================================
// Order Lifecycle
// ============================================================================
//
// The actors that move orders through their states:
// - intake    - places new orders and announces them
// - processor - claims Pending orders and settles them
// - sweeper   - expires orders stuck in Processing
// - notifier  - records an audit notification per terminal event
//
// The processor and the sweeper share nothing but the store and the channel.
//
// ============================================================================

mod intake;
mod notifier;
mod processor;
mod settlement;
mod sweeper;

pub use intake::{IntakeError, OrderIntake};
pub use notifier::LifecycleNotifier;
pub use processor::{LifecycleProcessor, ProcessOutcome};
pub use settlement::{FixedSettlement, RandomSettlement, SettlementConfig, SettlementOracle};
pub use sweeper::{ExpirationSweeper, SweepError, SweepReport, SweeperConfig};
