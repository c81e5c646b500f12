use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::settlement::SettlementOracle;
use crate::domain::order::{LifecycleEvent, OrderStatus};
use crate::messaging::{EventChannel, EventHandler, HandlerError};
use crate::metrics::LifecycleMetrics;
use crate::runtime::Shutdown;
use crate::store::{OrderStore, TransitionOutcome};

// ============================================================================
// Lifecycle Processor
// ============================================================================
//
// Consumes Created events and drives the order:
//
//   Pending --(claim)--> Processing --(settlement approved)--> Completed
//
// Both moves are conditional writes. A Created event for an order that has
// already left Pending is a duplicate delivery and changes nothing, except
// that a Completed order gets its Completed event published again: the
// redelivery may stem from a publish that failed after the write. If the
// sweeper expires the order while settlement is in flight, the completion
// write comes back as a conflict and no event is emitted.
//
// ============================================================================

const ACTOR: &str = "processor";

/// How a single Created delivery ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No order with that id; the message is dropped
    NotFound,
    /// The order had already left `Pending`
    Duplicate(OrderStatus),
    /// Settled and announced
    Completed,
    /// Settlement declined; the order stays in `Processing`
    Declined,
    /// Another writer moved the order first
    Conflict(OrderStatus),
}

pub struct LifecycleProcessor {
    store: Arc<dyn OrderStore>,
    channel: Arc<dyn EventChannel>,
    oracle: Arc<dyn SettlementOracle>,
    settlement_delay: Duration,
    metrics: Arc<LifecycleMetrics>,
    shutdown: Shutdown,
}

impl LifecycleProcessor {
    pub fn new(
        store: Arc<dyn OrderStore>,
        channel: Arc<dyn EventChannel>,
        oracle: Arc<dyn SettlementOracle>,
        settlement_delay: Duration,
        metrics: Arc<LifecycleMetrics>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            channel,
            oracle,
            settlement_delay,
            metrics,
            shutdown,
        }
    }

    pub async fn process_created(&self, order_id: Uuid) -> Result<ProcessOutcome, HandlerError> {
        let Some(order) = self.store.find_by_id(order_id).await? else {
            tracing::warn!(order_id = %order_id, "Order not found, dropping Created event");
            return Ok(ProcessOutcome::NotFound);
        };

        if order.status == OrderStatus::Completed {
            // The completion may have landed without its event; announce again
            self.channel
                .publish(&LifecycleEvent::completed(&order))
                .await?;
            tracing::debug!(order_id = %order_id, "Created redelivered for a completed order, re-announced");
            return Ok(ProcessOutcome::Duplicate(order.status));
        }

        if order.status != OrderStatus::Pending {
            tracing::debug!(
                order_id = %order_id,
                status = ?order.status,
                "Duplicate Created delivery, order already claimed"
            );
            return Ok(ProcessOutcome::Duplicate(order.status));
        }

        let order = match self
            .store
            .transition(order_id, OrderStatus::Pending, OrderStatus::Processing, Utc::now())
            .await?
        {
            TransitionOutcome::Applied(order) => order,
            TransitionOutcome::Conflict { current } => {
                tracing::debug!(order_id = %order_id, status = ?current, "Order claimed concurrently");
                self.metrics.record_conflict(ACTOR, current);
                return Ok(ProcessOutcome::Duplicate(current));
            }
            TransitionOutcome::NotFound => {
                tracing::warn!(order_id = %order_id, "Order vanished before claim");
                return Ok(ProcessOutcome::NotFound);
            }
        };
        self.metrics
            .record_transition(OrderStatus::Pending, OrderStatus::Processing);
        tracing::info!(order_id = %order_id, "Order moved to Processing, settling");

        if !self.shutdown.sleep(self.settlement_delay).await {
            tracing::info!(order_id = %order_id, "Settlement interrupted, order stays in Processing");
            return Err(HandlerError::Interrupted);
        }

        let approved = self.oracle.approve(&order);
        self.metrics.record_settlement(approved);
        if !approved {
            tracing::info!(order_id = %order_id, "Settlement declined, order stays in Processing");
            return Ok(ProcessOutcome::Declined);
        }

        match self
            .store
            .transition(order_id, OrderStatus::Processing, OrderStatus::Completed, Utc::now())
            .await?
        {
            TransitionOutcome::Applied(completed) => {
                self.metrics
                    .record_transition(OrderStatus::Processing, OrderStatus::Completed);
                self.channel
                    .publish(&LifecycleEvent::completed(&completed))
                    .await?;

                tracing::info!(order_id = %order_id, total = %completed.total, "Order completed");
                Ok(ProcessOutcome::Completed)
            }
            TransitionOutcome::Conflict { current } => {
                tracing::warn!(
                    order_id = %order_id,
                    status = ?current,
                    "Order left Processing during settlement, completion discarded"
                );
                self.metrics.record_conflict(ACTOR, current);
                Ok(ProcessOutcome::Conflict(current))
            }
            TransitionOutcome::NotFound => {
                tracing::warn!(order_id = %order_id, "Order vanished during settlement");
                Ok(ProcessOutcome::NotFound)
            }
        }
    }
}

#[async_trait]
impl EventHandler for LifecycleProcessor {
    fn name(&self) -> &'static str {
        ACTOR
    }

    async fn handle(&self, event: &LifecycleEvent) -> Result<(), HandlerError> {
        match event {
            LifecycleEvent::Created(created) => {
                self.process_created(created.order_id).await?;
                Ok(())
            }
            other => {
                tracing::debug!(event_type = other.kind().event_type(), "Ignoring non-Created event");
                Ok(())
            }
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
