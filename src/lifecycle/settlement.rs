use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;

use crate::domain::order::Order;

// ============================================================================
// Settlement Simulation
// ============================================================================
//
// Stand-in for a payment provider. The processor waits `delay`, then asks an
// oracle whether the order settles. Transition logic never touches `rand`.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub delay: Duration,
    pub success_probability: f64,
    /// Fixed seed for reproducible runs; entropy when absent
    pub seed: Option<u64>,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            success_probability: 0.5,
            seed: None,
        }
    }
}

pub trait SettlementOracle: Send + Sync {
    fn approve(&self, order: &Order) -> bool;
}

/// Bernoulli draw from a seeded or entropy-backed `StdRng`
pub struct RandomSettlement {
    success_probability: f64,
    rng: Mutex<StdRng>,
}

impl RandomSettlement {
    pub fn new(success_probability: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let success_probability = if success_probability.is_nan() {
            0.0
        } else {
            success_probability.clamp(0.0, 1.0)
        };

        Self {
            success_probability,
            rng: Mutex::new(rng),
        }
    }

    pub fn from_config(config: &SettlementConfig) -> Self {
        Self::new(config.success_probability, config.seed)
    }
}

impl SettlementOracle for RandomSettlement {
    fn approve(&self, order: &Order) -> bool {
        let approved = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .gen_bool(self.success_probability);

        tracing::debug!(order_id = %order.id, approved, "Settlement decision");
        approved
    }
}

/// Always returns the same answer
#[derive(Debug, Clone, Copy)]
pub struct FixedSettlement(pub bool);

impl SettlementOracle for FixedSettlement {
    fn approve(&self, _order: &Order) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::LineRequest;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn order() -> Order {
        Order::place(
            Uuid::new_v4(),
            vec![LineRequest::new(Uuid::new_v4(), 1, Decimal::ONE)],
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_same_seed_same_decisions() {
        let order = order();
        let a = RandomSettlement::new(0.5, Some(42));
        let b = RandomSettlement::new(0.5, Some(42));

        let left: Vec<bool> = (0..32).map(|_| a.approve(&order)).collect();
        let right: Vec<bool> = (0..32).map(|_| b.approve(&order)).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn test_probability_extremes() {
        let order = order();
        let never = RandomSettlement::new(0.0, None);
        let always = RandomSettlement::new(1.0, None);

        assert!((0..100).all(|_| !never.approve(&order)));
        assert!((0..100).all(|_| always.approve(&order)));
    }

    #[test]
    fn test_out_of_range_probability_is_clamped() {
        let order = order();
        assert!(RandomSettlement::new(7.0, Some(1)).approve(&order));
        assert!(!RandomSettlement::new(f64::NAN, Some(1)).approve(&order));
    }

    #[test]
    fn test_fixed_settlement() {
        let order = order();
        assert!(FixedSettlement(true).approve(&order));
        assert!(!FixedSettlement(false).approve(&order));
    }
}
