use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::domain::order::{LifecycleEvent, OrderStatus};
use crate::messaging::EventChannel;
use crate::metrics::LifecycleMetrics;
use crate::runtime::{HealthRegistry, HealthStatus, Shutdown};
use crate::store::{OrderStore, StoreError, TransitionOutcome};

// ============================================================================
// Expiration Sweeper
// ============================================================================
//
// Timer loop that reclaims orders stuck in Processing. Each run expires every
// Processing order whose `updated_at` is older than `now - timeout`, one
// conditional write per order, and announces each expiry after its write.
//
// An Expired event that cannot be published is kept and retried at the start
// of every later run until it goes out. A failed run is logged and reported;
// the loop keeps going.
//
// ============================================================================

const ACTOR: &str = "sweeper";
pub const HEALTH_COMPONENT: &str = "expiration_sweeper";

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl SweeperConfig {
    /// Timeout in whole minutes, as quoted in expiry notifications
    pub fn timeout_minutes(&self) -> i64 {
        (self.timeout.as_secs() / 60) as i64
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Expiration timeout {0:?} is out of range")]
    InvalidTimeout(Duration),

    #[error("{failed} Expired events could not be published ({expired} orders expired this run)")]
    Publish { failed: usize, expired: usize },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub candidates: usize,
    pub expired: usize,
    pub conflicts: usize,
}

pub struct ExpirationSweeper {
    store: Arc<dyn OrderStore>,
    channel: Arc<dyn EventChannel>,
    config: SweeperConfig,
    metrics: Arc<LifecycleMetrics>,
    health: Arc<HealthRegistry>,
    unannounced: Mutex<Vec<LifecycleEvent>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ExpirationSweeper {
    pub fn new(
        store: Arc<dyn OrderStore>,
        channel: Arc<dyn EventChannel>,
        config: SweeperConfig,
        metrics: Arc<LifecycleMetrics>,
        health: Arc<HealthRegistry>,
    ) -> Self {
        Self {
            store,
            channel,
            config,
            metrics,
            health,
            unannounced: Mutex::new(Vec::new()),
        }
    }

    /// Expired events still waiting for a successful publish
    pub fn unannounced(&self) -> usize {
        lock(&self.unannounced).len()
    }

    async fn announce(&self, event: LifecycleEvent) -> bool {
        match self.channel.publish(&event).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(order_id = %event.order_id(), error = %e, "Failed to publish Expired event");
                lock(&self.unannounced).push(event);
                false
            }
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, SweepError> {
        self.run_once_at(Utc::now()).await
    }

    /// One sweep as if the clock read `now`
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<SweepReport, SweepError> {
        let timeout = chrono::Duration::from_std(self.config.timeout)
            .map_err(|_| SweepError::InvalidTimeout(self.config.timeout))?;
        let deadline = now - timeout;

        let mut publish_failures = 0;
        let retries = std::mem::take(&mut *lock(&self.unannounced));
        for event in retries {
            let order_id = event.order_id();
            if self.announce(event).await {
                tracing::info!(order_id = %order_id, "Re-published Expired event");
            } else {
                publish_failures += 1;
            }
        }

        let candidates = self
            .store
            .find_by_status_older_than(OrderStatus::Processing, deadline)
            .await?;

        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };

        for candidate in candidates {
            let outcome = self
                .store
                .transition(candidate.id, OrderStatus::Processing, OrderStatus::Expired, now)
                .await?;

            match outcome {
                TransitionOutcome::Applied(order) => {
                    report.expired += 1;
                    self.metrics
                        .record_transition(OrderStatus::Processing, OrderStatus::Expired);
                    tracing::info!(
                        order_id = %order.id,
                        stale_since = %candidate.updated_at,
                        "Order expired"
                    );

                    if !self.announce(LifecycleEvent::expired(&order)).await {
                        publish_failures += 1;
                    }
                }
                TransitionOutcome::Conflict { current } => {
                    report.conflicts += 1;
                    self.metrics.record_conflict(ACTOR, current);
                    tracing::debug!(
                        order_id = %candidate.id,
                        status = ?current,
                        "Order left Processing before expiry"
                    );
                }
                TransitionOutcome::NotFound => {
                    tracing::debug!(order_id = %candidate.id, "Order vanished before expiry");
                }
            }
        }

        if publish_failures > 0 {
            return Err(SweepError::Publish {
                failed: publish_failures,
                expired: report.expired,
            });
        }

        Ok(report)
    }

    /// Sweep every `interval` until shutdown. The first run starts immediately.
    pub async fn run(&self, shutdown: Shutdown) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            "Expiration sweeper started"
        );

        loop {
            match self.run_once().await {
                Ok(report) => {
                    self.metrics.record_sweep(true, report.expired as u64);
                    self.health.update(HEALTH_COMPONENT, HealthStatus::Healthy, None);

                    if report.expired > 0 {
                        tracing::info!(
                            expired = report.expired,
                            conflicts = report.conflicts,
                            "Sweep finished"
                        );
                    } else {
                        tracing::debug!(candidates = report.candidates, "Sweep found nothing to expire");
                    }
                }
                Err(e) => {
                    let expired = match &e {
                        SweepError::Publish { expired, .. } => *expired as u64,
                        _ => 0,
                    };
                    self.metrics.record_sweep(false, expired);
                    self.health.update(
                        HEALTH_COMPONENT,
                        HealthStatus::Degraded(e.to_string()),
                        Some("last sweep failed".to_string()),
                    );
                    tracing::error!(error = %e, unannounced = self.unannounced(), "Sweep failed");
                }
            }

            if !shutdown.sleep(self.config.interval).await {
                break;
            }
        }

        tracing::info!("Expiration sweeper stopped");
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{EventKind, LineRequest, Order};
    use crate::messaging::{DeliveryPolicy, InMemoryChannel};
    use crate::runtime::shutdown_channel;
    use crate::store::InMemoryOrderStore;
    use chrono::Duration as TimeDelta;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    struct Harness {
        store: Arc<InMemoryOrderStore>,
        channel: Arc<InMemoryChannel>,
        health: Arc<HealthRegistry>,
        sweeper: ExpirationSweeper,
    }

    fn harness(interval: Duration) -> Harness {
        let metrics = Arc::new(LifecycleMetrics::new().unwrap());
        let store = Arc::new(InMemoryOrderStore::new());
        let channel = Arc::new(InMemoryChannel::new(DeliveryPolicy::default(), metrics.clone()));
        let health = Arc::new(HealthRegistry::new());
        let sweeper = ExpirationSweeper::new(
            store.clone(),
            channel.clone(),
            SweeperConfig {
                interval,
                timeout: Duration::from_secs(600),
            },
            metrics,
            health.clone(),
        );
        Harness {
            store,
            channel,
            health,
            sweeper,
        }
    }

    async fn order_in(store: &InMemoryOrderStore, status: OrderStatus, at: DateTime<Utc>) -> Order {
        let mut order = Order::place(
            Uuid::new_v4(),
            vec![LineRequest::new(Uuid::new_v4(), 1, Decimal::new(2500, 2))],
            at,
        )
        .unwrap();
        order.status = status;
        store.upsert(&order).await.unwrap();
        order
    }

    #[tokio::test]
    async fn test_expires_only_stale_processing_orders() {
        let h = harness(Duration::from_secs(60));
        let t0 = Utc::now();
        let now = t0 + TimeDelta::minutes(11);

        let stale = order_in(&h.store, OrderStatus::Processing, t0).await;
        let fresh = order_in(&h.store, OrderStatus::Processing, t0 + TimeDelta::minutes(5)).await;
        let pending = order_in(&h.store, OrderStatus::Pending, t0).await;
        let completed = order_in(&h.store, OrderStatus::Completed, t0).await;

        let report = h.sweeper.run_once_at(now).await.unwrap();

        assert_eq!(report.expired, 1);
        let expired = h.store.find_by_id(stale.id).await.unwrap().unwrap();
        assert_eq!(expired.status, OrderStatus::Expired);
        assert_eq!(expired.updated_at, now);

        for (order, status) in [
            (&fresh, OrderStatus::Processing),
            (&pending, OrderStatus::Pending),
            (&completed, OrderStatus::Completed),
        ] {
            let stored = h.store.find_by_id(order.id).await.unwrap().unwrap();
            assert_eq!(stored.status, status);
            assert_eq!(stored.updated_at, order.updated_at);
        }

        assert_eq!(
            h.channel.published_of(EventKind::Expired),
            vec![LifecycleEvent::expired(&expired)]
        );
    }

    #[tokio::test]
    async fn test_order_exactly_at_deadline_is_kept() {
        let h = harness(Duration::from_secs(60));
        let t0 = Utc::now();
        let order = order_in(&h.store, OrderStatus::Processing, t0).await;

        let report = h.sweeper.run_once_at(t0 + TimeDelta::minutes(10)).await.unwrap();

        assert_eq!(report, SweepReport::default());
        let stored = h.store.find_by_id(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Processing);
    }

    #[tokio::test]
    async fn test_empty_sweep_has_no_side_effects() {
        let h = harness(Duration::from_secs(60));
        let writes = h.store.write_count();

        let report = h.sweeper.run_once_at(Utc::now()).await.unwrap();

        assert_eq!(report.candidates, 0);
        assert_eq!(h.store.write_count(), writes);
        assert!(h.channel.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported_after_write() {
        let h = harness(Duration::from_secs(60));
        let t0 = Utc::now();
        let order = order_in(&h.store, OrderStatus::Processing, t0).await;
        h.channel.fail_next_publishes(1);

        let result = h.sweeper.run_once_at(t0 + TimeDelta::minutes(11)).await;

        assert!(matches!(result, Err(SweepError::Publish { failed: 1, expired: 1 })));
        let stored = h.store.find_by_id(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Expired);
        assert_eq!(h.sweeper.unannounced(), 1);
    }

    #[tokio::test]
    async fn test_unpublished_expiry_is_retried_next_run() {
        let h = harness(Duration::from_secs(60));
        let t0 = Utc::now();
        let order = order_in(&h.store, OrderStatus::Processing, t0).await;
        h.channel.fail_next_publishes(1);

        let first = h.sweeper.run_once_at(t0 + TimeDelta::minutes(11)).await;
        assert!(first.is_err());
        assert!(h.channel.published_of(EventKind::Expired).is_empty());

        let second = h.sweeper.run_once_at(t0 + TimeDelta::minutes(12)).await.unwrap();

        assert_eq!(second.candidates, 0);
        assert_eq!(h.sweeper.unannounced(), 0);
        let stored = h.store.find_by_id(order.id).await.unwrap().unwrap();
        assert_eq!(
            h.channel.published_of(EventKind::Expired),
            vec![LifecycleEvent::expired(&stored)]
        );
    }

    #[tokio::test]
    async fn test_retry_that_fails_again_stays_queued() {
        let h = harness(Duration::from_secs(60));
        let t0 = Utc::now();
        order_in(&h.store, OrderStatus::Processing, t0).await;
        h.channel.fail_next_publishes(2);

        h.sweeper.run_once_at(t0 + TimeDelta::minutes(11)).await.unwrap_err();
        let second = h.sweeper.run_once_at(t0 + TimeDelta::minutes(12)).await;

        assert!(matches!(second, Err(SweepError::Publish { failed: 1, expired: 0 })));
        assert_eq!(h.sweeper.unannounced(), 1);
        h.sweeper.run_once_at(t0 + TimeDelta::minutes(13)).await.unwrap();
        assert_eq!(h.channel.published_of(EventKind::Expired).len(), 1);
    }

    #[tokio::test]
    async fn test_loop_survives_failed_runs() {
        let h = Arc::new(harness(Duration::from_millis(10)));
        h.store.fail_next(1);
        let (trigger, shutdown) = shutdown_channel();

        let task = {
            let h = h.clone();
            tokio::spawn(async move { h.sweeper.run(shutdown).await })
        };

        // First run fails, a later one succeeds and reports healthy again
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = h.health.snapshot();
                if let Some(component) = snapshot.components.get(HEALTH_COMPONENT) {
                    if component.status.is_healthy() {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_timeout_minutes() {
        assert_eq!(SweeperConfig::default().timeout_minutes(), 10);
    }
}
