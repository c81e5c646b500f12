use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::order::{LifecycleEvent, LineRequest, Order, OrderError};
use crate::messaging::{ChannelError, EventChannel};
use crate::store::{OrderStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Invalid order: {0}")]
    Invalid(#[from] OrderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Order {order_id} was stored but its Created event was not published: {source}")]
    Publish {
        order_id: Uuid,
        #[source]
        source: ChannelError,
    },
}

/// Entry point for new orders: validate, persist as `Pending`, announce.
pub struct OrderIntake {
    store: Arc<dyn OrderStore>,
    channel: Arc<dyn EventChannel>,
}

impl OrderIntake {
    pub fn new(store: Arc<dyn OrderStore>, channel: Arc<dyn EventChannel>) -> Self {
        Self { store, channel }
    }

    pub async fn place_order(
        &self,
        user_id: Uuid,
        lines: Vec<LineRequest>,
    ) -> Result<Order, IntakeError> {
        let order = Order::place(user_id, lines, Utc::now())?;
        self.store.upsert(&order).await?;

        // Only announce what is durable
        self.channel
            .publish(&LifecycleEvent::created(&order))
            .await
            .map_err(|source| IntakeError::Publish {
                order_id: order.id,
                source,
            })?;

        tracing::info!(
            order_id = %order.id,
            user_id = %order.user_id,
            total = %order.total,
            line_count = order.lines.len(),
            "Order placed"
        );
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{EventKind, OrderStatus};
    use crate::messaging::{DeliveryPolicy, InMemoryChannel};
    use crate::metrics::LifecycleMetrics;
    use crate::store::InMemoryOrderStore;
    use rust_decimal::Decimal;

    fn setup() -> (Arc<InMemoryOrderStore>, Arc<InMemoryChannel>, OrderIntake) {
        let store = Arc::new(InMemoryOrderStore::new());
        let channel = Arc::new(InMemoryChannel::new(
            DeliveryPolicy::default(),
            Arc::new(LifecycleMetrics::new().unwrap()),
        ));
        let intake = OrderIntake::new(store.clone(), channel.clone());
        (store, channel, intake)
    }

    #[tokio::test]
    async fn test_place_order_persists_and_announces() {
        let (store, channel, intake) = setup();

        let order = intake
            .place_order(
                Uuid::new_v4(),
                vec![
                    LineRequest::new(Uuid::new_v4(), 2, Decimal::new(5000, 2)),
                    LineRequest::new(Uuid::new_v4(), 3, Decimal::new(1000, 2)),
                ],
            )
            .await
            .unwrap();

        assert_eq!(order.total, Decimal::new(13000, 2));
        let stored = store.find_by_id(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert_eq!(stored.lines.len(), 2);

        let created = channel.published_of(EventKind::Created);
        assert_eq!(created, vec![LifecycleEvent::created(&order)]);
    }

    #[tokio::test]
    async fn test_invalid_order_is_neither_stored_nor_announced() {
        let (store, channel, intake) = setup();

        let result = intake.place_order(Uuid::new_v4(), Vec::new()).await;

        assert!(matches!(result, Err(IntakeError::Invalid(OrderError::EmptyLines))));
        assert!(store.is_empty().await);
        assert!(channel.published().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_publishes_nothing() {
        let (store, channel, intake) = setup();
        store.fail_next(1);

        let result = intake
            .place_order(
                Uuid::new_v4(),
                vec![LineRequest::new(Uuid::new_v4(), 1, Decimal::ONE)],
            )
            .await;

        assert!(matches!(result, Err(IntakeError::Store(_))));
        assert!(channel.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_reports_stored_order() {
        let (store, channel, intake) = setup();
        channel.fail_next_publishes(1);

        let result = intake
            .place_order(
                Uuid::new_v4(),
                vec![LineRequest::new(Uuid::new_v4(), 1, Decimal::ONE)],
            )
            .await;

        let Err(IntakeError::Publish { order_id, .. }) = result else {
            panic!("expected publish error, got {result:?}");
        };
        assert!(store.find_by_id(order_id).await.unwrap().is_some());
    }
}
