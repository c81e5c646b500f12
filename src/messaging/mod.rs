// ============================================================================
// Event Channel
// ============================================================================
//
// At-least-once transport for lifecycle events, one topic per event kind.
//
// A handler error makes the channel redeliver the same message with
// exponential backoff. After `max_deliveries` attempts the message moves to
// the dead-letter destination and is acknowledged. `HandlerError::Interrupted`
// stops consumption without acknowledging.
//
// Backends:
// - memory   - in-process queues, used by tests and single-process runs
// - redpanda - rdkafka producer/consumer with manual offset commits
//
// ============================================================================

mod memory;
mod redpanda;

pub use memory::InMemoryChannel;
pub use redpanda::{RedpandaChannel, RedpandaConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::domain::order::{EventKind, LifecycleEvent};
use crate::metrics::LifecycleMetrics;
use crate::runtime::{HealthStatus, Shutdown};
use crate::store::StoreError;
use crate::utils::RetryConfig;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to encode {kind} event: {source}")]
    Encode {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("Subscription to {topic} failed: {reason}")]
    SubscriptionFailed { topic: String, reason: String },

    #[error("{0} already has a subscriber")]
    AlreadySubscribed(EventKind),

    #[error("Channel configuration error: {0}")]
    Configuration(String),
}

/// What a consumer hands back to the channel
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Handler interrupted by shutdown")]
    Interrupted,
}

/// Consumer of one or more event kinds.
///
/// Delivery is at-least-once: the same event may arrive more than once, and
/// after a partial failure. Implementations must make a repeat delivery a
/// no-op.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Label for logs and the handler duration histogram
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &LifecycleEvent) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Hand `event` to the transport. Returns once the transport accepted it.
    async fn publish(&self, event: &LifecycleEvent) -> Result<(), ChannelError>;

    /// Feed every `kind` message to `handler` until `shutdown` fires or the
    /// handler is interrupted.
    async fn subscribe(
        &self,
        kind: EventKind,
        handler: Arc<dyn EventHandler>,
        shutdown: Shutdown,
    ) -> Result<(), ChannelError>;

    /// Transport health as seen by the publisher
    fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

// ============================================================================
// Topics
// ============================================================================

#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn for_kind(&self, kind: EventKind) -> String {
        format!("{}.{}", self.prefix, kind.topic_suffix())
    }

    pub fn dead_letter(&self) -> String {
        format!("{}.dead-letter", self.prefix)
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new("orders")
    }
}

// ============================================================================
// Redelivery
// ============================================================================

#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    /// Handler attempts per message, including the first
    pub max_deliveries: u32,
    /// Spacing between attempts
    pub backoff: RetryConfig,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            backoff: RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
        }
    }
}

/// A message that exhausted its deliveries or could not be decoded
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub source_topic: String,
    pub key: Option<String>,
    pub payload: String,
    pub error_message: String,
    pub failure_count: u32,
    pub failed_at: DateTime<Utc>,
}

pub(crate) enum Delivery {
    Acked,
    DeadLettered { reason: String, attempts: u32 },
    Interrupted,
}

/// Run `handler` against one message until it acks, runs out of attempts or
/// shutdown interrupts it. Shared by every backend.
pub(crate) async fn deliver(
    handler: &dyn EventHandler,
    event: &LifecycleEvent,
    policy: &DeliveryPolicy,
    shutdown: &Shutdown,
    metrics: &LifecycleMetrics,
) -> Delivery {
    let mut attempt = 0;

    loop {
        attempt += 1;

        let started = Instant::now();
        let result = handler.handle(event).await;
        metrics.observe_handler(handler.name(), started.elapsed().as_secs_f64());

        match result {
            Ok(()) => return Delivery::Acked,
            Err(HandlerError::Interrupted) => {
                tracing::info!(
                    handler = handler.name(),
                    order_id = %event.order_id(),
                    "Handler interrupted, leaving message unacknowledged"
                );
                return Delivery::Interrupted;
            }
            Err(error) if attempt >= policy.max_deliveries => {
                tracing::error!(
                    handler = handler.name(),
                    order_id = %event.order_id(),
                    event_type = event.kind().event_type(),
                    attempts = attempt,
                    error = %error,
                    "Handler exhausted deliveries"
                );
                return Delivery::DeadLettered {
                    reason: error.to_string(),
                    attempts: attempt,
                };
            }
            Err(error) => {
                let delay = policy.backoff.delay_after(attempt);
                tracing::warn!(
                    handler = handler.name(),
                    order_id = %event.order_id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Handler failed, redelivering"
                );
                if !shutdown.sleep(delay).await {
                    return Delivery::Interrupted;
                }
            }
        }
    }
}
