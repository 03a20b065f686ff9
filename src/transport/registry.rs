use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::metrics::DeliveryMetrics;
use crate::notification::ChannelKind;
use crate::template::RenderedContent;

use super::{ChannelTransport, SendOutcome};

struct RegisteredTransport {
    transport: Arc<dyn ChannelTransport>,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

/// A reserved send slot on one channel, released on drop.
pub struct SendPermit {
    channel: ChannelKind,
    _permit: OwnedSemaphorePermit,
}

impl SendPermit {
    pub fn channel(&self) -> ChannelKind {
        self.channel
    }
}

/// Tagged dispatch from channel kind to transport.
pub struct TransportRegistry {
    transports: HashMap<ChannelKind, RegisteredTransport>,
    send_timeout: Duration,
}

impl TransportRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            transports: HashMap::new(),
            send_timeout,
        }
    }

    /// Register `transport` for its channel kind, replacing any previous one.
    pub fn register(&mut self, transport: Arc<dyn ChannelTransport>, concurrency: usize) {
        let concurrency = concurrency.max(1);
        self.transports.insert(
            transport.kind(),
            RegisteredTransport {
                transport,
                permits: Arc::new(Semaphore::new(concurrency)),
                concurrency,
            },
        );
    }

    pub fn with_transport(mut self, transport: Arc<dyn ChannelTransport>, concurrency: usize) -> Self {
        self.register(transport, concurrency);
        self
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn ChannelTransport>> {
        self.transports.get(&kind).map(|t| t.transport.clone())
    }

    /// Registered kinds in declaration order
    pub fn kinds(&self) -> Vec<ChannelKind> {
        let mut kinds: Vec<ChannelKind> = self.transports.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Free send slots for `kind`, `None` when no transport is registered.
    pub fn available_permits(&self, kind: ChannelKind) -> Option<usize> {
        self.transports.get(&kind).map(|t| t.permits.available_permits())
    }

    pub fn concurrency(&self, kind: ChannelKind) -> Option<usize> {
        self.transports.get(&kind).map(|t| t.concurrency)
    }

    /// Wait for a send slot on `channel`.
    ///
    /// Fails with the outcome the send would have had: permanent when no
    /// transport is registered, transient when the limiter is closed.
    pub async fn acquire(&self, channel: ChannelKind) -> Result<SendPermit, SendOutcome> {
        let Some(entry) = self.transports.get(&channel) else {
            return Err(SendOutcome::PermanentFailed(format!(
                "no transport configured for {}",
                channel
            )));
        };
        match entry.permits.clone().acquire_owned().await {
            Ok(permit) => Ok(SendPermit {
                channel,
                _permit: permit,
            }),
            Err(_) => Err(SendOutcome::TransientFailed("transport closed".into())),
        }
    }

    /// Send through the transport for `channel`.
    ///
    /// Waits for a concurrency permit, then bounds the send by the
    /// configured timeout. A timeout is a transient failure; a channel with
    /// no transport is a permanent one.
    pub async fn send(
        &self,
        channel: ChannelKind,
        address: &str,
        content: &RenderedContent,
    ) -> SendOutcome {
        match self.acquire(channel).await {
            Ok(permit) => self.send_with(permit, address, content).await,
            Err(outcome) => outcome,
        }
    }

    /// Send using a slot reserved with [`TransportRegistry::acquire`].
    pub async fn send_with(
        &self,
        permit: SendPermit,
        address: &str,
        content: &RenderedContent,
    ) -> SendOutcome {
        let channel = permit.channel;
        let Some(entry) = self.transports.get(&channel) else {
            return SendOutcome::PermanentFailed(format!("no transport configured for {}", channel));
        };

        DeliveryMetrics::send_started();
        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.send_timeout,
            entry.transport.send(address, content),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => SendOutcome::TransientFailed(format!(
                "send timed out after {}ms",
                self.send_timeout.as_millis()
            )),
        };
        DeliveryMetrics::send_finished(channel, outcome.metric_label(), started);
        drop(permit);

        outcome
    }
}
