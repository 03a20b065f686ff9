use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::config::IntakeConfig;
use crate::engine::Engine;
use crate::error::SubmitError;
use crate::metrics::IntakeMetrics;
use crate::notification::{ChannelKind, DeliveryMode, NotificationRequest, NotificationTarget};
use crate::retry::{BackoffPolicy, ExponentialBackoff};

/// Message format received from Redis Pub/Sub
#[derive(Debug, Deserialize)]
pub struct IntakeMessage {
    /// Idempotency key of the notification
    pub id: String,
    pub template_id: String,
    /// Target type: "user", "users", "group", "broadcast"
    #[serde(rename = "type")]
    pub target_type: String,
    /// Target value (user id, group name, or list of user ids)
    pub target: Option<IntakeTarget>,
    /// Ordered channel preference
    pub channels: Vec<ChannelKind>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
}

/// Target value of an intake message
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IntakeTarget {
    Single(String),
    Multiple(Vec<String>),
}

impl IntakeMessage {
    fn parse_target(&self) -> Option<NotificationTarget> {
        match self.target_type.as_str() {
            "user" => match &self.target {
                Some(IntakeTarget::Single(id)) => Some(NotificationTarget::User(id.clone())),
                _ => None,
            },
            "users" => match &self.target {
                Some(IntakeTarget::Multiple(ids)) => Some(NotificationTarget::Users(ids.clone())),
                Some(IntakeTarget::Single(id)) => Some(NotificationTarget::Users(vec![id.clone()])),
                None => None,
            },
            "group" => match &self.target {
                Some(IntakeTarget::Single(group)) => Some(NotificationTarget::Group(group.clone())),
                _ => None,
            },
            "broadcast" => Some(NotificationTarget::Broadcast),
            _ => None,
        }
    }

    /// Convert into a request; `None` when the target is not understood.
    pub fn into_request(self) -> Option<NotificationRequest> {
        let target = self.parse_target()?;
        let mut builder = NotificationRequest::builder(self.id, self.template_id)
            .target(target)
            .channels(self.channels)
            .payload(self.payload)
            .delivery_mode(self.delivery_mode);
        if let Some(locale) = self.locale {
            builder = builder.locale(locale);
        }
        Some(builder.build())
    }
}

/// Redis Pub/Sub intake: every message is one notification request
pub struct RedisIntake {
    config: IntakeConfig,
    redis_url: String,
    engine: Engine,
    shutdown: broadcast::Sender<()>,
}

impl RedisIntake {
    pub fn new(config: IntakeConfig, redis_url: impl Into<String>, engine: Engine) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            redis_url: redis_url.into(),
            engine,
            shutdown,
        }
    }

    /// Get a shutdown signal sender
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Run the subscriber until shutdown, reconnecting with backoff.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.config.channels.is_empty() {
            tracing::info!("No intake channels configured, skipping Redis intake");
            return Ok(());
        }

        tracing::info!(channels = ?self.config.channels, "Starting Redis intake");

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut backoff = ExponentialBackoff::new(BackoffPolicy::new(
            self.config.reconnect_initial_ms,
            self.config.reconnect_max_ms,
            0.1,
        ));

        loop {
            match self
                .run_subscription_loop(&mut shutdown_rx, &mut backoff)
                .await
            {
                Ok(()) => {
                    tracing::info!("Redis intake stopped gracefully");
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    IntakeMetrics::record_reconnection();
                    tracing::error!(
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Redis intake error, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            tracing::info!("Redis intake stopped while reconnecting");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Ok(())
    }

    async fn run_subscription_loop(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
        backoff: &mut ExponentialBackoff,
    ) -> anyhow::Result<()> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;

        // Subscribe to channels (with pattern support)
        for channel in &self.config.channels {
            if channel.contains('*') || channel.contains('?') || channel.contains('[') {
                pubsub.psubscribe(channel).await?;
                tracing::debug!(pattern = %channel, "Subscribed to pattern");
            } else {
                pubsub.subscribe(channel).await?;
                tracing::debug!(channel = %channel, "Subscribed to channel");
            }
        }

        tracing::info!("Redis intake subscription established");
        backoff.reset();

        let mut message_stream = pubsub.on_message();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Received shutdown signal");
                    return Ok(());
                }
                msg = message_stream.next() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("Redis message stream ended");
                    };
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to get message payload");
                            IntakeMetrics::record_message("malformed");
                            continue;
                        }
                    };

                    self.handle_message(&channel, &payload).await;
                }
            }
        }
    }

    /// Parse and submit one message. Failures are logged, never propagated.
    pub async fn handle_message(&self, channel: &str, payload: &str) {
        tracing::debug!(channel = %channel, "Received intake message");

        let message: IntakeMessage = match serde_json::from_str(payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    channel = %channel,
                    "Failed to parse intake message"
                );
                IntakeMetrics::record_message("malformed");
                return;
            }
        };

        let target_type = message.target_type.clone();
        let Some(request) = message.into_request() else {
            tracing::warn!(
                target_type = %target_type,
                channel = %channel,
                "Unknown target in intake message"
            );
            IntakeMetrics::record_message("malformed");
            return;
        };

        match self.engine.submit(request).await {
            Ok(id) => {
                IntakeMetrics::record_message("submitted");
                tracing::debug!(channel = %channel, notification_id = %id, "Submitted notification from Redis");
            }
            Err(SubmitError::DuplicateRequest {
                notification_id,
                status,
            }) => {
                IntakeMetrics::record_message("duplicate");
                tracing::debug!(
                    notification_id = %notification_id,
                    status = %status,
                    "Duplicate intake message ignored"
                );
            }
            Err(e) if e.is_validation() => {
                IntakeMetrics::record_message("rejected");
                tracing::warn!(channel = %channel, code = e.code(), error = %e, "Intake message rejected");
            }
            Err(e) => {
                IntakeMetrics::record_message("error");
                tracing::error!(channel = %channel, error = %e, "Failed to submit intake message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::notification::NotificationId;

    #[test]
    fn test_parse_user_message() {
        let json = r#"{
            "id": "order-456-shipped",
            "template_id": "order_shipped",
            "type": "user",
            "target": "user-123",
            "channels": ["email", "sms"],
            "payload": {"order_id": "456"}
        }"#;

        let message: IntakeMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.target_type, "user");
        let request = message.into_request().unwrap();
        assert_eq!(request.target, NotificationTarget::User("user-123".into()));
        assert_eq!(request.channels, vec![ChannelKind::Email, ChannelKind::Sms]);
        assert_eq!(request.delivery_mode, DeliveryMode::AllChannels);
    }

    #[test]
    fn test_parse_group_message_with_options() {
        let json = r#"{
            "id": "maint-1",
            "template_id": "maintenance",
            "type": "group",
            "target": "ops",
            "channels": ["push", "email"],
            "locale": "pt-BR",
            "delivery_mode": "first_available"
        }"#;

        let request = serde_json::from_str::<IntakeMessage>(json)
            .unwrap()
            .into_request()
            .unwrap();
        assert_eq!(request.target, NotificationTarget::Group("ops".into()));
        assert_eq!(request.locale.as_deref(), Some("pt-BR"));
        assert_eq!(request.delivery_mode, DeliveryMode::FirstAvailable);
    }

    #[test]
    fn test_parse_multiple_users_and_broadcast() {
        let users = r#"{"id": "a", "template_id": "t", "type": "users",
                        "target": ["user-1", "user-2"], "channels": ["sms"]}"#;
        let request = serde_json::from_str::<IntakeMessage>(users)
            .unwrap()
            .into_request()
            .unwrap();
        match request.target {
            NotificationTarget::Users(ids) => assert_eq!(ids.len(), 2),
            other => panic!("Expected users target, got {:?}", other),
        }

        let broadcast = r#"{"id": "b", "template_id": "t", "type": "broadcast",
                            "target": null, "channels": ["push"]}"#;
        let request = serde_json::from_str::<IntakeMessage>(broadcast)
            .unwrap()
            .into_request()
            .unwrap();
        assert_eq!(request.target, NotificationTarget::Broadcast);
    }

    #[test]
    fn test_unknown_target_type() {
        let json = r#"{"id": "c", "template_id": "t", "type": "channel",
                       "target": "orders", "channels": ["email"]}"#;
        let message: IntakeMessage = serde_json::from_str(json).unwrap();
        assert!(message.into_request().is_none());
    }

    #[tokio::test]
    async fn test_handle_message_submits_and_skips_malformed() {
        let engine = Engine::from_settings(Settings::default()).await.unwrap();
        let intake = RedisIntake::new(IntakeConfig::default(), "redis://localhost:6379", engine.clone());

        intake.handle_message("notifications", "not json").await;
        // Template unknown: rejected synchronously, nothing stored
        intake
            .handle_message(
                "notifications",
                r#"{"id": "x-1", "template_id": "missing", "type": "broadcast", "channels": ["sms"]}"#,
            )
            .await;

        assert!(engine.status(&NotificationId::from("x-1")).await.is_err());
        assert_eq!(engine.stats().rejected, 1);
    }
}
