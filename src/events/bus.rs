use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::{EventSettings, OverflowPolicy};
use crate::metrics::EventMetrics;

use super::{BroadcastSink, DeliveryEvent, EventSink, TracingSink};

struct Inner {
    tx: mpsc::Sender<DeliveryEvent>,
    overflow: OverflowPolicy,
    capacity: usize,
    broadcast: Arc<BroadcastSink>,
    closing: Arc<Notify>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded event queue with a background consumer.
///
/// Cloning is cheap; all clones publish into the same queue. Must be created
/// inside a Tokio runtime.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Bus with the tracing and broadcast sinks.
    pub fn new(settings: &EventSettings) -> Self {
        Self::with_sinks(settings, Vec::new())
    }

    /// Bus with the default sinks plus `extra`.
    pub fn with_sinks(settings: &EventSettings, extra: Vec<Arc<dyn EventSink>>) -> Self {
        let capacity = settings.capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let broadcast = Arc::new(BroadcastSink::new(capacity));
        let closing = Arc::new(Notify::new());

        let mut sinks: Vec<Arc<dyn EventSink>> = vec![
            Arc::new(TracingSink::new(settings.log_transitions)),
            broadcast.clone(),
        ];
        sinks.extend(extra);

        let consumer = tokio::spawn(run_consumer(rx, sinks, closing.clone()));

        Self {
            inner: Arc::new(Inner {
                tx,
                overflow: settings.overflow,
                capacity,
                broadcast,
                closing,
                consumer: Mutex::new(Some(consumer)),
            }),
        }
    }

    /// Publish an event. Returns false if it was dropped.
    pub async fn publish(&self, event: DeliveryEvent) -> bool {
        let accepted = match self.inner.overflow {
            OverflowPolicy::DropNewest => match self.inner.tx.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(event)) => {
                    tracing::debug!(
                        notification_id = %event.notification_id(),
                        "Event queue full, dropping event"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            OverflowPolicy::Block => self.inner.tx.send(event).await.is_ok(),
        };

        if accepted {
            EventMetrics::record_published();
        } else {
            EventMetrics::record_dropped();
        }
        accepted
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.inner.broadcast.subscribe()
    }

    /// Events queued but not yet consumed
    pub fn pending(&self) -> usize {
        self.inner.capacity - self.inner.tx.capacity()
    }

    /// Stop accepting events and wait for the queued ones to be handled.
    pub async fn shutdown(&self) {
        self.inner.closing.notify_one();
        let handle = self
            .inner
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Event consumer task failed");
            }
        }
    }
}

async fn run_consumer(
    mut rx: mpsc::Receiver<DeliveryEvent>,
    sinks: Vec<Arc<dyn EventSink>>,
    closing: Arc<Notify>,
) {
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => dispatch(&sinks, &event).await,
                None => break,
            },
            _ = closing.notified() => {
                rx.close();
                let mut flushed = 0usize;
                while let Some(event) = rx.recv().await {
                    dispatch(&sinks, &event).await;
                    flushed += 1;
                }
                tracing::debug!(flushed = flushed, "Event queue drained");
                break;
            }
        }
    }
}

async fn dispatch(sinks: &[Arc<dyn EventSink>], event: &DeliveryEvent) {
    for sink in sinks {
        sink.handle(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{NotificationId, NotificationStatus};
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<DeliveryEvent>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn handle(&self, event: &DeliveryEvent) {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen.lock().unwrap().push(event.clone());
        }
    }

    fn event(n: usize) -> DeliveryEvent {
        DeliveryEvent::status_changed(
            &NotificationId::new(format!("n-{}", n)),
            None,
            NotificationStatus::Pending,
        )
    }

    fn settings(capacity: usize, overflow: OverflowPolicy) -> EventSettings {
        EventSettings {
            capacity,
            overflow,
            log_transitions: false,
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let sink = Arc::new(RecordingSink::default());
        let bus = EventBus::with_sinks(&settings(16, OverflowPolicy::DropNewest), vec![sink.clone()]);

        for n in 0..5 {
            assert!(bus.publish(event(n)).await);
        }
        bus.shutdown().await;

        assert_eq!(sink.seen.lock().unwrap().len(), 5);
        // Closed after shutdown
        assert!(!bus.publish(event(99)).await);
    }

    #[tokio::test]
    async fn test_drop_newest_when_full() {
        let sink = Arc::new(RecordingSink::default());
        let bus = EventBus::with_sinks(&settings(1, OverflowPolicy::DropNewest), vec![sink.clone()]);

        // No await point yields to the consumer between these sends
        let accepted = {
            let mut accepted = 0;
            for n in 0..4 {
                if bus.publish(event(n)).await {
                    accepted += 1;
                }
            }
            accepted
        };
        assert_eq!(accepted, 1);
        assert_eq!(bus.pending(), 1);

        bus.shutdown().await;
        assert_eq!(sink.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_capacity() {
        let sink = Arc::new(RecordingSink {
            delay: Some(Duration::from_millis(5)),
            ..RecordingSink::default()
        });
        let bus = EventBus::with_sinks(&settings(1, OverflowPolicy::Block), vec![sink.clone()]);

        for n in 0..4 {
            assert!(bus.publish(event(n)).await);
        }
        bus.shutdown().await;
        assert_eq!(sink.seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let bus = EventBus::new(&settings(8, OverflowPolicy::DropNewest));
        let mut rx = bus.subscribe();

        bus.publish(event(1)).await;
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.notification_id().as_str(), "n-1");
    }
}
