use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::notification::Notification;
use crate::domain::order::LifecycleEvent;
use crate::messaging::{EventHandler, HandlerError};
use crate::store::NotificationLog;

/// Downstream consumer of Completed and Expired events. Writes one audit
/// notification per `(order id, kind)` no matter how often an event arrives.
pub struct LifecycleNotifier {
    log: Arc<dyn NotificationLog>,
    expiration_minutes: i64,
}

impl LifecycleNotifier {
    pub fn new(log: Arc<dyn NotificationLog>, expiration_minutes: i64) -> Self {
        Self {
            log,
            expiration_minutes,
        }
    }
}

#[async_trait]
impl EventHandler for LifecycleNotifier {
    fn name(&self) -> &'static str {
        "notifier"
    }

    async fn handle(&self, event: &LifecycleEvent) -> Result<(), HandlerError> {
        let Some(notification) = Notification::from_event(event, self.expiration_minutes) else {
            return Ok(());
        };

        if !self.log.record_once(&notification).await? {
            tracing::debug!(
                order_id = %notification.order_id,
                kind = %notification.kind,
                "Notification already recorded, skipping duplicate"
            );
            return Ok(());
        }

        tracing::info!(
            order_id = %notification.order_id,
            kind = %notification.kind,
            message = %notification.message,
            "Recorded notification"
        );

        if let LifecycleEvent::Completed(completed) = event {
            // Mock e-mail delivery
            tracing::info!(
                user_id = %completed.user_id,
                order_id = %completed.order_id,
                total = %completed.total,
                "Sending order confirmation e-mail"
            );
        }

        Ok(())
    }
}
