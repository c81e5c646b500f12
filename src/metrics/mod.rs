// Private module declaration
mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::domain::order::{EventKind, OrderStatus};
use crate::utils::CircuitState;

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for the order lifecycle
// ============================================================================
//
// Covers:
// - Status transitions and conditional-write conflicts
// - Settlement outcomes
// - Sweeper runs and expirations
// - Event publishing, dead-lettering and handler latency
// - Broker circuit breaker state
//
// Scraped via /metrics on the metrics server.
// ============================================================================

pub struct LifecycleMetrics {
    registry: Registry,

    // Order state machine
    pub transitions_total: IntCounterVec,
    pub transition_conflicts_total: IntCounterVec,
    pub settlement_outcomes_total: IntCounterVec,

    // Sweeper
    pub sweeper_runs_total: IntCounterVec,
    pub orders_expired_total: IntCounter,

    // Event channel
    pub events_published_total: IntCounterVec,
    pub events_publish_failed_total: IntCounterVec,
    pub events_dead_lettered_total: IntCounterVec,
    pub handler_duration_seconds: HistogramVec,
    pub circuit_breaker_state: IntGauge,
}

impl LifecycleMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let transitions_total = IntCounterVec::new(
            Opts::new("order_transitions_total", "Order status transitions applied"),
            &["from", "to"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let transition_conflicts_total = IntCounterVec::new(
            Opts::new(
                "order_transition_conflicts_total",
                "Conditional status writes rejected because the order had moved on",
            ),
            &["actor", "current"],
        )?;
        registry.register(Box::new(transition_conflicts_total.clone()))?;

        let settlement_outcomes_total = IntCounterVec::new(
            Opts::new("settlement_outcomes_total", "Simulated settlement results"),
            &["outcome"],
        )?;
        registry.register(Box::new(settlement_outcomes_total.clone()))?;

        let sweeper_runs_total = IntCounterVec::new(
            Opts::new("sweeper_runs_total", "Expiration sweeper runs"),
            &["result"],
        )?;
        registry.register(Box::new(sweeper_runs_total.clone()))?;

        let orders_expired_total = IntCounter::new(
            "orders_expired_total",
            "Orders moved from Processing to Expired by the sweeper",
        )?;
        registry.register(Box::new(orders_expired_total.clone()))?;

        let events_published_total = IntCounterVec::new(
            Opts::new("events_published_total", "Lifecycle events handed to the channel"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_published_total.clone()))?;

        let events_publish_failed_total = IntCounterVec::new(
            Opts::new("events_publish_failed_total", "Lifecycle events that could not be published"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_publish_failed_total.clone()))?;

        let events_dead_lettered_total = IntCounterVec::new(
            Opts::new("events_dead_lettered_total", "Messages moved to the dead-letter destination"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_dead_lettered_total.clone()))?;

        let handler_duration_seconds = HistogramVec::new(
            HistogramOpts::new("event_handler_duration_seconds", "Event handler duration")
                .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            &["handler"],
        )?;
        registry.register(Box::new(handler_duration_seconds.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Broker circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            registry,
            transitions_total,
            transition_conflicts_total,
            settlement_outcomes_total,
            sweeper_runs_total,
            orders_expired_total,
            events_published_total,
            events_publish_failed_total,
            events_dead_lettered_total,
            handler_duration_seconds,
            circuit_breaker_state,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_transition(&self, from: OrderStatus, to: OrderStatus) {
        self.transitions_total
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
    }

    pub fn record_conflict(&self, actor: &str, current: OrderStatus) {
        self.transition_conflicts_total
            .with_label_values(&[actor, current.as_str()])
            .inc();
    }

    pub fn record_settlement(&self, approved: bool) {
        let outcome = if approved { "approved" } else { "declined" };
        self.settlement_outcomes_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_sweep(&self, succeeded: bool, expired: u64) {
        let result = if succeeded { "ok" } else { "error" };
        self.sweeper_runs_total.with_label_values(&[result]).inc();
        self.orders_expired_total.inc_by(expired);
    }

    pub fn record_publish(&self, kind: EventKind, succeeded: bool) {
        let counter = if succeeded {
            &self.events_published_total
        } else {
            &self.events_publish_failed_total
        };
        counter.with_label_values(&[kind.event_type()]).inc();
    }

    pub fn record_dead_letter(&self, kind: EventKind) {
        self.events_dead_lettered_total
            .with_label_values(&[kind.event_type()])
            .inc();
    }

    pub fn observe_handler(&self, handler: &str, seconds: f64) {
        self.handler_duration_seconds
            .with_label_values(&[handler])
            .observe(seconds);
    }

    pub fn set_circuit_state(&self, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        self.circuit_breaker_state.set(value);
    }
}
