use async_trait::async_trait;
use chrono::Utc;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::Message,
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
    Offset, TopicPartitionList,
};
use std::sync::Arc;
use std::time::Duration;

use super::{
    deliver, ChannelError, DeadLetter, Delivery, DeliveryPolicy, EventChannel, EventHandler, Topics,
};
use crate::domain::order::{EventKind, LifecycleEvent};
use crate::metrics::LifecycleMetrics;
use crate::runtime::{HealthStatus, Shutdown};
use crate::utils::{
    retry_with_backoff, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
    RetryConfig,
};

// ============================================================================
// Redpanda Event Channel
// ============================================================================
//
// Producer side: every send goes through the circuit breaker, and a publish
// is retried with backoff before the error reaches the caller. The record
// key is the order id so all events of one order share a partition.
//
// Consumer side: one consumer group per event kind, auto-commit disabled.
// The offset is committed only after the handler acked the message or it was
// written to the dead-letter topic. If the dead-letter write itself fails the
// loop stops without committing, so the message comes back on restart.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct RedpandaConfig {
    pub brokers: String,
    pub consumer_group: String,
    pub topic_prefix: String,
    pub send_timeout: Duration,
    pub publish_retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RedpandaConfig {
    fn default() -> Self {
        Self {
            brokers: "127.0.0.1:9092".to_string(),
            consumer_group: "order-lifecycle".to_string(),
            topic_prefix: "orders".to_string(),
            send_timeout: Duration::from_secs(5),
            publish_retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Owned copy of a consumed record, so nothing borrowed from the consumer
/// lives across the handler call.
struct ConsumedRecord {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<String>,
    payload: Vec<u8>,
}

impl ConsumedRecord {
    fn from_message<M: Message>(message: &M) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

pub struct RedpandaChannel {
    producer: FutureProducer,
    config: RedpandaConfig,
    topics: Topics,
    circuit_breaker: CircuitBreaker,
    policy: DeliveryPolicy,
    metrics: Arc<LifecycleMetrics>,
}

impl RedpandaChannel {
    pub fn new(
        config: RedpandaConfig,
        policy: DeliveryPolicy,
        metrics: Arc<LifecycleMetrics>,
    ) -> Result<Self, ChannelError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .create()
            .map_err(|e| ChannelError::Configuration(format!("Failed to create producer: {e}")))?;

        tracing::info!(brokers = %config.brokers, prefix = %config.topic_prefix, "Created Redpanda producer");

        Ok(Self {
            producer,
            topics: Topics::new(config.topic_prefix.clone()),
            circuit_breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            config,
            policy,
            metrics,
        })
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    /// One send attempt through the circuit breaker
    async fn send_once(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), ChannelError> {
        let result = self
            .circuit_breaker
            .call(async {
                let record = FutureRecord::to(topic).key(key).payload(payload);
                self.producer
                    .send(record, Timeout::After(self.config.send_timeout))
                    .await
                    .map(|_| ())
                    .map_err(|(e, _)| e)
            })
            .await;

        self.metrics.set_circuit_state(self.circuit_breaker.state());

        match result {
            Ok(()) => Ok(()),
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::error!(topic, "Circuit breaker open - Redpanda unavailable");
                Err(ChannelError::CircuitOpen(topic.to_string()))
            }
            Err(CircuitBreakerError::OperationFailed(e)) => Err(ChannelError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), ChannelError> {
        retry_with_backoff(&self.config.publish_retry, "redpanda_publish", |_| {
            self.send_once(topic, key, payload)
        })
        .await
    }

    async fn dead_letter(
        &self,
        kind: EventKind,
        record: &ConsumedRecord,
        reason: String,
        attempts: u32,
    ) -> Result<(), ChannelError> {
        let letter = DeadLetter {
            source_topic: record.topic.clone(),
            key: record.key.clone(),
            payload: String::from_utf8_lossy(&record.payload).into_owned(),
            error_message: reason,
            failure_count: attempts,
            failed_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&letter).map_err(|source| ChannelError::Encode { kind, source })?;
        let topic = self.topics.dead_letter();

        self.send(&topic, record.key.as_deref().unwrap_or_default(), &payload)
            .await?;
        self.metrics.record_dead_letter(kind);

        tracing::warn!(
            source_topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            dead_letter_topic = %topic,
            "Moved message to dead-letter topic"
        );
        Ok(())
    }

    fn create_consumer(&self, kind: EventKind, topic: &str) -> Result<StreamConsumer, ChannelError> {
        let group_id = format!("{}.{}", self.config.consumer_group, kind.topic_suffix());

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| ChannelError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: format!("Failed to create consumer: {e}"),
            })?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| ChannelError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(topic, consumer_group = %group_id, manual_commit = true, "Subscribed to topic");
        Ok(consumer)
    }

    fn commit(consumer: &StreamConsumer, record: &ConsumedRecord) {
        let mut offsets = TopicPartitionList::new();
        let committed = offsets
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .and_then(|()| consumer.commit(&offsets, CommitMode::Async));

        if let Err(e) = committed {
            tracing::warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Failed to commit offset (message may be redelivered)"
            );
        }
    }
}

#[async_trait]
impl EventChannel for RedpandaChannel {
    async fn publish(&self, event: &LifecycleEvent) -> Result<(), ChannelError> {
        let kind = event.kind();
        let topic = self.topics.for_kind(kind);
        let key = event.order_id().to_string();
        let payload = event
            .encode_payload()
            .map_err(|source| ChannelError::Encode { kind, source })?;

        match self.send(&topic, &key, &payload).await {
            Ok(()) => {
                self.metrics.record_publish(kind, true);
                tracing::info!(topic = %topic, key = %key, "Published to Redpanda");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_publish(kind, false);
                tracing::error!(topic = %topic, key = %key, error = %e, "Failed to publish to Redpanda");
                Err(e)
            }
        }
    }

    async fn subscribe(
        &self,
        kind: EventKind,
        handler: Arc<dyn EventHandler>,
        shutdown: Shutdown,
    ) -> Result<(), ChannelError> {
        let topic = self.topics.for_kind(kind);
        let consumer = self.create_consumer(kind, &topic)?;

        // One message at a time so offsets commit in order. Throughput per
        // subscription is bounded by handler latency; add partitions and
        // processes to scale.
        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                received = consumer.recv() => received.map(|m| ConsumedRecord::from_message(&m)),
            };

            let record = match received {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "Failed to receive message");
                    if !shutdown.sleep(Duration::from_secs(1)).await {
                        break;
                    }
                    continue;
                }
            };

            let event = match LifecycleEvent::decode_payload(kind, &record.payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(
                        topic = %record.topic,
                        offset = record.offset,
                        error = %e,
                        "Undecodable payload"
                    );
                    self.dead_letter(kind, &record, format!("decode error: {e}"), 1)
                        .await?;
                    Self::commit(&consumer, &record);
                    continue;
                }
            };

            match deliver(handler.as_ref(), &event, &self.policy, &shutdown, &self.metrics).await {
                Delivery::Acked => Self::commit(&consumer, &record),
                Delivery::DeadLettered { reason, attempts } => {
                    self.dead_letter(kind, &record, reason, attempts).await?;
                    Self::commit(&consumer, &record);
                }
                Delivery::Interrupted => break,
            }
        }

        tracing::info!(handler = handler.name(), topic = %topic, "Subscription stopped");
        Ok(())
    }

    fn health(&self) -> HealthStatus {
        match self.circuit_state() {
            CircuitState::Closed => HealthStatus::Healthy,
            CircuitState::HalfOpen => HealthStatus::Degraded("circuit breaker half-open".to_string()),
            CircuitState::Open => HealthStatus::Unhealthy("circuit breaker open".to_string()),
        }
    }
}
