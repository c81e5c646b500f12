use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::{
    deliver, ChannelError, DeadLetter, Delivery, DeliveryPolicy, EventChannel, EventHandler, Topics,
};
use crate::domain::order::{EventKind, LifecycleEvent};
use crate::metrics::LifecycleMetrics;
use crate::runtime::Shutdown;

// ============================================================================
// In-process Event Channel
// ============================================================================
//
// One unbounded queue per event kind. Messages published before anyone
// subscribes are buffered. Each kind has at most one live subscriber; when a
// subscriber stops, the queue is handed back so the next one resumes where it
// left off.
//
// ============================================================================

struct Queue {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
    rx: Option<mpsc::UnboundedReceiver<LifecycleEvent>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

pub struct InMemoryChannel {
    topics: Topics,
    policy: DeliveryPolicy,
    metrics: Arc<LifecycleMetrics>,
    queues: Mutex<HashMap<EventKind, Queue>>,
    published: Mutex<Vec<LifecycleEvent>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    injected_failures: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryChannel {
    pub fn new(policy: DeliveryPolicy, metrics: Arc<LifecycleMetrics>) -> Self {
        Self {
            topics: Topics::default(),
            policy,
            metrics,
            queues: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            dead_letters: Mutex::new(Vec::new()),
            injected_failures: AtomicU32::new(0),
        }
    }

    /// Every event accepted by `publish`, in order
    pub fn published(&self) -> Vec<LifecycleEvent> {
        lock(&self.published).clone()
    }

    pub fn published_of(&self, kind: EventKind) -> Vec<LifecycleEvent> {
        lock(&self.published)
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.dead_letters).clone()
    }

    /// Make the next `count` publishes fail as if the broker were down
    pub fn fail_next_publishes(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn enqueue(&self, event: LifecycleEvent) -> Result<(), ChannelError> {
        let kind = event.kind();
        lock(&self.queues)
            .entry(kind)
            .or_insert_with(Queue::new)
            .tx
            .send(event)
            .map_err(|_| ChannelError::PublishFailed {
                topic: self.topics.for_kind(kind),
                reason: "queue closed".to_string(),
            })
    }

    fn dead_letter(&self, event: &LifecycleEvent, reason: String, attempts: u32) {
        let payload = event
            .encode_payload()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();

        lock(&self.dead_letters).push(DeadLetter {
            source_topic: self.topics.for_kind(event.kind()),
            key: Some(event.order_id().to_string()),
            payload,
            error_message: reason,
            failure_count: attempts,
            failed_at: Utc::now(),
        });
        self.metrics.record_dead_letter(event.kind());
    }
}

#[async_trait]
impl EventChannel for InMemoryChannel {
    async fn publish(&self, event: &LifecycleEvent) -> Result<(), ChannelError> {
        let kind = event.kind();

        if self.take_injected_failure() {
            self.metrics.record_publish(kind, false);
            return Err(ChannelError::PublishFailed {
                topic: self.topics.for_kind(kind),
                reason: "injected failure".to_string(),
            });
        }

        self.enqueue(event.clone())?;
        lock(&self.published).push(event.clone());
        self.metrics.record_publish(kind, true);

        tracing::debug!(
            event_type = kind.event_type(),
            order_id = %event.order_id(),
            "Published event"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        kind: EventKind,
        handler: Arc<dyn EventHandler>,
        shutdown: Shutdown,
    ) -> Result<(), ChannelError> {
        let mut rx = lock(&self.queues)
            .entry(kind)
            .or_insert_with(Queue::new)
            .rx
            .take()
            .ok_or(ChannelError::AlreadySubscribed(kind))?;

        tracing::info!(handler = handler.name(), topic = %self.topics.for_kind(kind), "Subscribed");

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                next = rx.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            match deliver(handler.as_ref(), &event, &self.policy, &shutdown, &self.metrics).await {
                Delivery::Acked => {}
                Delivery::DeadLettered { reason, attempts } => {
                    self.dead_letter(&event, reason, attempts);
                }
                Delivery::Interrupted => {
                    // Unacknowledged: put it back for the next subscriber
                    self.enqueue(event)?;
                    break;
                }
            }
        }

        if let Some(queue) = lock(&self.queues).get_mut(&kind) {
            queue.rx = Some(rx);
        }

        tracing::info!(handler = handler.name(), "Subscription stopped");
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{LineRequest, Order};
    use crate::messaging::HandlerError;
    use crate::runtime::shutdown_channel;
    use crate::store::StoreError;
    use crate::utils::RetryConfig;
    use rust_decimal::Decimal;
    use std::time::Duration;
    use uuid::Uuid;

    struct FlakyHandler {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyHandler {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicU32::new(times),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn handle(&self, _event: &LifecycleEvent) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(StoreError::Unavailable("flaky".to_string()).into());
            }
            Ok(())
        }
    }

    fn channel(max_deliveries: u32) -> Arc<InMemoryChannel> {
        let policy = DeliveryPolicy {
            max_deliveries,
            backoff: RetryConfig {
                max_attempts: max_deliveries,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
            },
        };
        Arc::new(InMemoryChannel::new(
            policy,
            Arc::new(LifecycleMetrics::new().unwrap()),
        ))
    }

    fn created_event() -> LifecycleEvent {
        let order = Order::place(
            Uuid::new_v4(),
            vec![LineRequest::new(Uuid::new_v4(), 1, Decimal::new(1000, 2))],
            Utc::now(),
        )
        .unwrap();
        LifecycleEvent::created(&order)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_buffers_until_subscribed() {
        let channel = channel(3);
        channel.publish(&created_event()).await.unwrap();

        let handler = FlakyHandler::failing(0);
        let (trigger, shutdown) = shutdown_channel();
        let task = {
            let channel = channel.clone();
            let handler = handler.clone();
            tokio::spawn(async move { channel.subscribe(EventKind::Created, handler, shutdown).await })
        };

        wait_for(|| handler.calls() == 1).await;
        trigger.trigger();
        task.await.unwrap().unwrap();

        assert_eq!(channel.published_of(EventKind::Created).len(), 1);
        assert!(channel.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_failed_handler_is_redelivered() {
        let channel = channel(3);
        let handler = FlakyHandler::failing(2);
        let (trigger, shutdown) = shutdown_channel();
        let task = {
            let channel = channel.clone();
            let handler = handler.clone();
            tokio::spawn(async move { channel.subscribe(EventKind::Created, handler, shutdown).await })
        };

        channel.publish(&created_event()).await.unwrap();
        wait_for(|| handler.calls() == 3).await;
        trigger.trigger();
        task.await.unwrap().unwrap();

        assert!(channel.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_message_is_dead_lettered() {
        let channel = channel(3);
        let handler = FlakyHandler::failing(u32::MAX);
        let (trigger, shutdown) = shutdown_channel();
        let task = {
            let channel = channel.clone();
            let handler = handler.clone();
            tokio::spawn(async move { channel.subscribe(EventKind::Created, handler, shutdown).await })
        };

        let event = created_event();
        channel.publish(&event).await.unwrap();
        wait_for(|| !channel.dead_letters().is_empty()).await;
        trigger.trigger();
        task.await.unwrap().unwrap();

        let letters = channel.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].failure_count, 3);
        assert_eq!(letters[0].source_topic, "orders.order-created");
        assert_eq!(letters[0].key, Some(event.order_id().to_string()));
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn test_single_subscriber_per_kind() {
        let channel = channel(3);
        let (trigger, shutdown) = shutdown_channel();
        let task = {
            let channel = channel.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                channel
                    .subscribe(EventKind::Expired, FlakyHandler::failing(0), shutdown)
                    .await
            })
        };

        channel.publish(&created_event()).await.unwrap();
        // Give the first subscriber time to claim the queue
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = channel
            .subscribe(EventKind::Expired, FlakyHandler::failing(0), shutdown)
            .await;
        assert!(matches!(second, Err(ChannelError::AlreadySubscribed(EventKind::Expired))));

        trigger.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let channel = channel(3);
        channel.fail_next_publishes(1);

        assert!(channel.publish(&created_event()).await.is_err());
        assert!(channel.publish(&created_event()).await.is_ok());
        assert_eq!(channel.published().len(), 1);
    }
}
