use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::notification::ChannelKind;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub events: EventSettings,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub transports: TransportSettings,
    #[serde(default)]
    pub recovery: RecoverySettings,
    #[serde(default)]
    pub directory: SeedSettings,
    #[serde(default)]
    pub templates: SeedSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    /// Upper bound on attempts per job, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-send timeout in milliseconds (a timeout is a transient failure)
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Capacity of the internal work queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long shutdown waits for in-flight sends
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
    /// Locale used when neither request nor recipient carries one
    #[serde(default = "default_locale")]
    pub default_locale: String,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_locale() -> String {
    "en".to_string()
}

impl DispatchSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter is drawn from [0, delay * jitter_factor]
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_jitter_factor() -> f64 {
    0.1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Consecutive store failures before the circuit opens
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_reset_timeout_ms")]
    pub circuit_reset_timeout_ms: u64,
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "ara:delivery".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    600
}

/// What the event bus does when its queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the event being published and count it
    #[default]
    DropNewest,
    /// Wait for capacity
    Block,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventSettings {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    /// Log every transition through the tracing sink
    #[serde(default = "default_true")]
    pub log_transitions: bool,
}

fn default_event_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Pub/sub channels; entries containing `*` are subscribed as patterns
    #[serde(default = "default_intake_channels")]
    pub channels: Vec<String>,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_intake_channels() -> Vec<String> {
    vec!["notifications:submit".to_string()]
}

fn default_reconnect_initial_ms() -> u64 {
    100
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Record sends in memory (development and tests)
    #[default]
    Memory,
    /// POST to an HTTP relay (or to the address itself for webhooks)
    Http,
    /// No transport; jobs on this channel fail permanently
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub mode: TransportMode,
    /// Relay endpoint for email/sms/push in http mode
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Sent as a bearer token when present
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Maximum concurrent sends on this channel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Sends kept for inspection in memory mode; 0 keeps none
    #[serde(default = "default_memory_log_capacity")]
    pub memory_log_capacity: usize,
}

fn default_concurrency() -> usize {
    16
}

fn default_memory_log_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportSettings {
    #[serde(default)]
    pub email: TransportConfig,
    #[serde(default)]
    pub sms: TransportConfig,
    #[serde(default)]
    pub push: TransportConfig,
    #[serde(default)]
    pub webhook: TransportConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySettings {
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_seconds: u64,
    /// InFlight jobs untouched for this long are re-dispatched
    #[serde(default = "default_stale_in_flight")]
    pub stale_in_flight_seconds: u64,
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_stale_in_flight() -> u64 {
    120
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedSettings {
    #[serde(default)]
    pub seed_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
    /// Fallback filter when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-delivery-engine".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("dispatch.max_attempts", 5)?
            .set_default("store.backend", "memory")?
            .set_default("redis.url", "redis://localhost:6379")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // DELIVERY_DISPATCH__MAX_ATTEMPTS, DELIVERY_STORE__BACKEND, DELIVERY_INTAKE__CHANNELS, ...
            .add_source(
                Environment::with_prefix("DELIVERY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("intake.channels"),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::Message(
                "dispatch.max_attempts must be at least 1".into(),
            ));
        }
        if self.dispatch.queue_capacity == 0 || self.events.capacity == 0 {
            return Err(ConfigError::Message(
                "queue capacities must be at least 1".into(),
            ));
        }
        if self.recovery.stale_in_flight_seconds.saturating_mul(1000) <= self.dispatch.send_timeout_ms {
            return Err(ConfigError::Message(
                "recovery.stale_in_flight_seconds must exceed dispatch.send_timeout_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::Message(
                "retry.jitter_factor must be within 0.0..=1.0".into(),
            ));
        }
        for (name, transport) in self.transports.iter() {
            if transport.concurrency == 0 {
                return Err(ConfigError::Message(format!(
                    "transports.{}.concurrency must be at least 1",
                    name
                )));
            }
            // Webhooks post to the recipient's own URL; the other channels need a relay
            let has_endpoint = transport
                .endpoint
                .as_deref()
                .is_some_and(|e| !e.trim().is_empty());
            if transport.mode == TransportMode::Http && name != "webhook" && !has_endpoint {
                return Err(ConfigError::Message(format!(
                    "transports.{}.endpoint is required in http mode",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl TransportSettings {
    pub fn for_channel(&self, channel: ChannelKind) -> &TransportConfig {
        match channel {
            ChannelKind::Email => &self.email,
            ChannelKind::Sms => &self.sms,
            ChannelKind::Push => &self.push,
            ChannelKind::Webhook => &self.webhook,
        }
    }

    /// Per-channel configs keyed by channel name.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &TransportConfig)> {
        [
            ("email", &self.email),
            ("sms", &self.sms),
            ("push", &self.push),
            ("webhook", &self.webhook),
        ]
        .into_iter()
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            send_timeout_ms: default_send_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            drain_timeout_seconds: default_drain_timeout(),
            default_locale: default_locale(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout_ms: default_circuit_reset_timeout_ms(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
            overflow: OverflowPolicy::default(),
            log_transitions: true,
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channels: default_intake_channels(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            endpoint: None,
            auth_token: None,
            concurrency: default_concurrency(),
            memory_log_capacity: default_memory_log_capacity(),
        }
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            reconcile_interval_seconds: default_reconcile_interval(),
            stale_in_flight_seconds: default_stale_in_flight(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_log_filter(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.dispatch.max_attempts, 5);
        assert_eq!(settings.dispatch.default_locale, "en");
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.events.overflow, OverflowPolicy::DropNewest);
        assert_eq!(settings.transports.webhook.mode, TransportMode::Memory);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let raw = r#"
            [dispatch]
            max_attempts = 3

            [store]
            backend = "postgres"

            [events]
            overflow = "block"

            [transports.webhook]
            mode = "http"
            concurrency = 4
        "#;
        let settings: Settings = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.dispatch.max_attempts, 3);
        assert_eq!(settings.dispatch.send_timeout_ms, 10_000);
        assert_eq!(settings.store.backend, StoreBackend::Postgres);
        assert_eq!(settings.events.overflow, OverflowPolicy::Block);
        assert_eq!(settings.transports.webhook.mode, TransportMode::Http);
        assert_eq!(settings.transports.webhook.concurrency, 4);
        assert_eq!(settings.transports.email.concurrency, 16);
        assert_eq!(settings.transports.email.memory_log_capacity, 1024);
    }

    #[test]
    fn test_validate_rejects_short_stale_threshold() {
        let mut settings = Settings::default();
        settings.dispatch.send_timeout_ms = 60_000;
        settings.recovery.stale_in_flight_seconds = 30;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut settings = Settings::default();
        settings.dispatch.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut settings = Settings::default();
        settings.transports.sms.concurrency = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("transports.sms"));
    }

    #[test]
    fn test_validate_rejects_http_relay_without_endpoint() {
        let mut settings = Settings::default();
        settings.transports.email.mode = TransportMode::Http;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("transports.email.endpoint"));

        settings.transports.email.endpoint = Some("  ".into());
        assert!(settings.validate().is_err());

        settings.transports.email.endpoint = Some("http://relay.local/send".into());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_saturates_large_stale_threshold() {
        let mut settings = Settings::default();
        settings.recovery.stale_in_flight_seconds = u64::MAX;
        assert!(settings.validate().is_ok());
    }
}
