//! In-memory transport: records every send and replays scripted outcomes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::notification::ChannelKind;
use crate::template::RenderedContent;

use super::{ChannelTransport, SendOutcome};

/// One send observed by a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub address: String,
    pub content: RenderedContent,
    pub outcome: SendOutcome,
    pub at: DateTime<Utc>,
}

/// Sends kept in the log unless configured otherwise
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

pub struct MemoryTransport {
    kind: ChannelKind,
    /// Outcomes consumed in order per address; `Succeeded` once exhausted
    scripts: DashMap<String, VecDeque<SendOutcome>>,
    fallback: Mutex<VecDeque<SendOutcome>>,
    /// Most recent sends, oldest dropped first
    log: Mutex<VecDeque<SentMessage>>,
    log_capacity: usize,
    delay: Option<Duration>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryTransport {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            scripts: DashMap::new(),
            fallback: Mutex::new(VecDeque::new()),
            log: Mutex::new(VecDeque::new()),
            log_capacity: DEFAULT_LOG_CAPACITY,
            delay: None,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Delay every send, to exercise timeouts and concurrency limits.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Keep at most `capacity` sends in the log. Zero disables the log.
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Queue outcomes for sends to `address`.
    pub fn script(&self, address: impl Into<String>, outcomes: impl IntoIterator<Item = SendOutcome>) {
        self.scripts
            .entry(address.into())
            .or_default()
            .extend(outcomes);
    }

    /// Queue outcomes for sends to any address without its own script.
    pub fn script_any(&self, outcomes: impl IntoIterator<Item = SendOutcome>) {
        self.fallback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(outcomes);
    }

    /// Logged sends, including failures, oldest first.
    pub fn calls(&self) -> Vec<SentMessage> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Sends that succeeded.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.calls()
            .into_iter()
            .filter(|m| m.outcome.is_success())
            .collect()
    }

    pub fn calls_to(&self, address: &str) -> usize {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.address == address)
            .count()
    }

    /// Highest number of sends observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, address: &str) -> SendOutcome {
        let scripted = self
            .scripts
            .get_mut(address)
            .and_then(|mut script| script.pop_front());
        // Drained scripts are dropped so the map only holds pending outcomes
        self.scripts.remove_if(address, |_, script| script.is_empty());
        if let Some(outcome) = scripted {
            return outcome;
        }
        self.fallback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(SendOutcome::Succeeded)
    }
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, address: &str, content: &RenderedContent) -> SendOutcome {
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.peak.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self.next_outcome(address);
        tracing::debug!(
            channel = %self.kind,
            address = %address,
            outcome = outcome.metric_label(),
            "Memory transport send"
        );

        if self.log_capacity > 0 {
            let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
            if log.len() >= self.log_capacity {
                log.pop_front();
            }
            log.push_back(SentMessage {
                address: address.to_string(),
                content: content.clone(),
                outcome: outcome.clone(),
                at: Utc::now(),
            });
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_outcomes_then_success() {
        let transport = MemoryTransport::new(ChannelKind::Email);
        transport.script(
            "a@example.com",
            [
                SendOutcome::TransientFailed("421".into()),
                SendOutcome::PermanentFailed("550".into()),
            ],
        );
        let content = RenderedContent::text("hello");

        assert!(matches!(
            transport.send("a@example.com", &content).await,
            SendOutcome::TransientFailed(_)
        ));
        assert!(matches!(
            transport.send("a@example.com", &content).await,
            SendOutcome::PermanentFailed(_)
        ));
        assert_eq!(transport.send("a@example.com", &content).await, SendOutcome::Succeeded);
        assert_eq!(transport.send("b@example.com", &content).await, SendOutcome::Succeeded);

        assert_eq!(transport.calls().len(), 4);
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(transport.calls_to("a@example.com"), 3);
    }

    #[tokio::test]
    async fn test_fallback_script() {
        let transport = MemoryTransport::new(ChannelKind::Sms);
        transport.script_any([SendOutcome::TransientFailed("busy".into())]);

        let content = RenderedContent::text("hi");
        assert!(!transport.send("+1", &content).await.is_success());
        assert!(transport.send("+1", &content).await.is_success());
    }

    #[tokio::test]
    async fn test_log_keeps_most_recent_sends() {
        let transport = MemoryTransport::new(ChannelKind::Email).with_log_capacity(100);
        let content = RenderedContent::text("hello");

        for i in 0..10_000 {
            transport.send(&format!("user{}@example.com", i), &content).await;
        }

        let calls = transport.calls();
        assert_eq!(calls.len(), 100);
        assert_eq!(calls[0].address, "user9900@example.com");
        assert_eq!(calls[99].address, "user9999@example.com");
    }

    #[tokio::test]
    async fn test_disabled_log_and_drained_scripts() {
        let transport = MemoryTransport::new(ChannelKind::Sms).with_log_capacity(0);
        transport.script("+1", [SendOutcome::TransientFailed("busy".into())]);
        let content = RenderedContent::text("hi");

        assert!(!transport.send("+1", &content).await.is_success());
        assert!(transport.scripts.is_empty());
        assert!(transport.send("+1", &content).await.is_success());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_send_releases_slot() {
        let transport = MemoryTransport::new(ChannelKind::Push).with_delay(Duration::from_millis(100));
        let content = RenderedContent::text("hi");

        let result =
            tokio::time::timeout(Duration::from_millis(10), transport.send("token", &content)).await;
        assert!(result.is_err());
        assert_eq!(transport.active.load(Ordering::SeqCst), 0);
        assert!(transport.calls().is_empty());
    }
}
