//! Channel transports.
//!
//! A transport sends one rendered message to one address and classifies the
//! result. Transports are selected by [`ChannelKind`] through the
//! [`TransportRegistry`], which also enforces the per-channel concurrency
//! limit and the send timeout.

mod classify;
mod http;
mod memory;
mod registry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{TransportMode, TransportSettings};
use crate::notification::ChannelKind;
use crate::template::RenderedContent;

pub use classify::{classify_http_status, classify_smtp_reply};
pub use http::{HttpRelayError, HttpRelayTransport};
pub use memory::{MemoryTransport, SentMessage, DEFAULT_LOG_CAPACITY};
pub use registry::{SendPermit, TransportRegistry};

/// Result of a single send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Succeeded,
    /// May succeed on retry (timeout, rate limit, temporary unavailability)
    TransientFailed(String),
    /// Will not succeed on retry (invalid address, rejected content)
    PermanentFailed(String),
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Succeeded)
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            SendOutcome::Succeeded => "succeeded",
            SendOutcome::TransientFailed(_) => "transient",
            SendOutcome::PermanentFailed(_) => "permanent",
        }
    }
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn name(&self) -> &str;

    /// Deliver `content` to `address`. Never panics on delivery errors;
    /// every failure is reported through the outcome.
    async fn send(&self, address: &str, content: &RenderedContent) -> SendOutcome;
}

/// Build a registry from configuration.
///
/// `disabled` channels, and `http` channels whose relay cannot be built, get
/// no transport, so their jobs fail permanently instead of being reported as
/// delivered.
pub fn build_registry(settings: &TransportSettings, send_timeout: Duration) -> TransportRegistry {
    let mut registry = TransportRegistry::new(send_timeout);

    for kind in ChannelKind::ALL {
        let config = settings.for_channel(kind);
        let transport: Arc<dyn ChannelTransport> = match config.mode {
            TransportMode::Disabled => {
                tracing::info!(channel = %kind, "Channel transport disabled");
                continue;
            }
            TransportMode::Memory => Arc::new(
                MemoryTransport::new(kind).with_log_capacity(config.memory_log_capacity),
            ),
            TransportMode::Http => match HttpRelayTransport::from_config(kind, config, send_timeout) {
                Ok(transport) => Arc::new(transport),
                Err(e) => {
                    tracing::error!(
                        channel = %kind,
                        error = %e,
                        "HTTP relay transport unavailable, jobs on this channel will fail"
                    );
                    continue;
                }
            },
        };

        tracing::info!(
            channel = %kind,
            transport = %transport.name(),
            concurrency = config.concurrency,
            "Channel transport registered"
        );
        registry.register(transport, config.concurrency);
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    #[test]
    fn test_metric_labels() {
        assert_eq!(SendOutcome::Succeeded.metric_label(), "succeeded");
        assert_eq!(SendOutcome::TransientFailed("x".into()).metric_label(), "transient");
        assert_eq!(SendOutcome::PermanentFailed("x".into()).metric_label(), "permanent");
        assert!(SendOutcome::Succeeded.is_success());
    }

    #[test]
    fn test_build_registry_skips_disabled() {
        let mut settings = TransportSettings::default();
        settings.push = TransportConfig {
            mode: TransportMode::Disabled,
            ..TransportConfig::default()
        };

        let registry = build_registry(&settings, Duration::from_secs(1));
        assert_eq!(
            registry.kinds(),
            vec![ChannelKind::Email, ChannelKind::Sms, ChannelKind::Webhook]
        );
        assert_eq!(registry.get(ChannelKind::Sms).map(|t| t.name().to_string()), Some("memory".into()));
    }

    #[tokio::test]
    async fn test_http_relay_without_endpoint_is_not_registered() {
        let mut settings = TransportSettings::default();
        settings.email = TransportConfig {
            mode: TransportMode::Http,
            ..TransportConfig::default()
        };
        settings.sms = TransportConfig {
            mode: TransportMode::Http,
            endpoint: Some("not a url".into()),
            ..TransportConfig::default()
        };

        let registry = build_registry(&settings, Duration::from_secs(1));
        assert!(registry.get(ChannelKind::Email).is_none());
        assert!(registry.get(ChannelKind::Sms).is_none());

        let content = RenderedContent::text("hello");
        let outcome = registry
            .send(ChannelKind::Email, "alice@example.com", &content)
            .await;
        assert!(matches!(outcome, SendOutcome::PermanentFailed(_)));
        let outcome = registry.send(ChannelKind::Sms, "+15550001", &content).await;
        assert!(matches!(outcome, SendOutcome::PermanentFailed(_)));
    }
}
