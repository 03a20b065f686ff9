use async_trait::async_trait;
use tokio::sync::broadcast;

use super::DeliveryEvent;

/// External observer of delivery events. Handling is best-effort.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &DeliveryEvent);
}

/// Logs every event through `tracing`.
pub struct TracingSink {
    verbose: bool,
}

impl TracingSink {
    /// With `verbose` transitions log at info, otherwise at debug.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

#[async_trait]
impl EventSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn handle(&self, event: &DeliveryEvent) {
        match event {
            DeliveryEvent::JobTransition {
                notification_id,
                job_id,
                from,
                to,
                ..
            } => {
                let from = from.map(|s| s.as_str()).unwrap_or("none");
                if self.verbose {
                    tracing::info!(
                        notification_id = %notification_id,
                        job_id = %job_id,
                        from = from,
                        to = %to,
                        "Job state changed"
                    );
                } else {
                    tracing::debug!(
                        notification_id = %notification_id,
                        job_id = %job_id,
                        from = from,
                        to = %to,
                        "Job state changed"
                    );
                }
            }
            DeliveryEvent::NotificationStatusChanged {
                notification_id,
                from,
                to,
                ..
            } => {
                let from = from.map(|s| s.as_str()).unwrap_or("none");
                if self.verbose {
                    tracing::info!(
                        notification_id = %notification_id,
                        from = from,
                        to = %to,
                        "Notification status changed"
                    );
                } else {
                    tracing::debug!(
                        notification_id = %notification_id,
                        from = from,
                        to = %to,
                        "Notification status changed"
                    );
                }
            }
        }
    }
}

/// Republishes events to in-process subscribers.
pub struct BroadcastSink {
    tx: broadcast::Sender<DeliveryEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn handle(&self, event: &DeliveryEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{NotificationId, NotificationStatus};

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        assert_eq!(sink.subscriber_count(), 1);

        let event = DeliveryEvent::status_changed(
            &NotificationId::from("n-1"),
            None,
            NotificationStatus::Pending,
        );
        sink.handle(&event).await;
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers() {
        let sink = BroadcastSink::new(1);
        let event = DeliveryEvent::status_changed(
            &NotificationId::from("n-2"),
            Some(NotificationStatus::Pending),
            NotificationStatus::Delivered,
        );
        sink.handle(&event).await;
        TracingSink::new(true).handle(&event).await;
    }
}
