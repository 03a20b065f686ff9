//! Logging and OpenTelemetry tracing setup.
//!
//! Logs go through a `tracing-subscriber` fmt layer (plain or JSON). When
//! `otel.enabled` is set, spans are also exported over OTLP gRPC.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RUST_LOG` | Log filter, overrides `logging.filter` | unset |
//! | `DELIVERY_LOGGING__JSON` | Emit JSON log lines | `false` |
//! | `DELIVERY_OTEL__ENABLED` | Enable OpenTelemetry tracing | `false` |
//! | `DELIVERY_OTEL__ENDPOINT` | OTLP gRPC endpoint | `http://localhost:4317` |
//! | `DELIVERY_OTEL__SERVICE_NAME` | Service name in traces | `ara-delivery-engine` |
//! | `DELIVERY_OTEL__SAMPLING_RATIO` | Trace sampling ratio (0.0-1.0) | `1.0` |

use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LoggingConfig, OtelConfig};

/// Result type for telemetry operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Telemetry-specific error type
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed to build OTLP exporter: {0}")]
    ExporterBuild(String),
    #[error("Failed to install tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Keeps the tracer provider alive; flushes spans on drop.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            tracing::info!("Shutting down OpenTelemetry tracer provider");
            if let Err(e) = provider.shutdown() {
                tracing::warn!(error = %e, "OpenTelemetry shutdown failed");
            }
        }
    }
}

/// Log filter: `RUST_LOG` first, then the configured filter, then `info`.
fn env_filter(logging: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Hold the returned guard for the lifetime
/// of the process.
pub fn init_telemetry(logging: &LoggingConfig, otel: &OtelConfig) -> TelemetryResult<TelemetryGuard> {
    let fmt_layer = if logging.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let provider = if otel.enabled {
        Some(init_otel_tracer(otel)?)
    } else {
        None
    };
    let otel_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(otel.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(logging))
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    if otel.enabled {
        tracing::info!(
            endpoint = %otel.endpoint,
            service_name = %otel.service_name,
            sampling_ratio = %otel.sampling_ratio,
            "OpenTelemetry tracing initialized"
        );
    } else {
        tracing::info!(json = logging.json, "Tracing initialized (OpenTelemetry disabled)");
    }

    Ok(TelemetryGuard { provider })
}

fn sampler(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(ratio)
    }
}

fn init_otel_tracer(config: &OtelConfig) -> TelemetryResult<SdkTracerProvider> {
    use opentelemetry::KeyValue;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.endpoint)
        .build()
        .map_err(|e| TelemetryError::ExporterBuild(e.to_string()))?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(sampler(config.sampling_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(vec![
            KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                config.service_name.clone(),
            ),
            KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            ),
        ]))
        .build();

    Ok(provider)
}

/// Span attribute helpers.
pub mod attributes {
    use opentelemetry::KeyValue;

    use crate::notification::{ChannelKind, JobId, JobState, NotificationId};

    pub fn notification_id(id: &NotificationId) -> KeyValue {
        KeyValue::new("notification.id", id.to_string())
    }

    pub fn job_id(id: JobId) -> KeyValue {
        KeyValue::new("delivery.job_id", id.to_string())
    }

    pub fn channel(kind: ChannelKind) -> KeyValue {
        KeyValue::new("delivery.channel", kind.as_str())
    }

    pub fn template_id(id: &str) -> KeyValue {
        KeyValue::new("notification.template_id", id.to_string())
    }

    pub fn target_type(t: &str) -> KeyValue {
        KeyValue::new("notification.target_type", t.to_string())
    }

    pub fn attempt(n: u32) -> KeyValue {
        KeyValue::new("delivery.attempt", n as i64)
    }

    pub fn job_state(state: JobState) -> KeyValue {
        KeyValue::new("delivery.job_state", state.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{ChannelKind, JobState, NotificationId};

    #[test]
    fn test_default_config() {
        let config = OtelConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.endpoint, "http://localhost:4317");
        assert_eq!(config.service_name, "ara-delivery-engine");
        assert_eq!(config.sampling_ratio, 1.0);
    }

    #[test]
    fn test_sampler_bounds() {
        assert!(matches!(sampler(1.5), Sampler::AlwaysOn));
        assert!(matches!(sampler(0.0), Sampler::AlwaysOff));
        assert!(matches!(sampler(0.25), Sampler::TraceIdRatioBased(r) if r == 0.25));
    }

    #[test]
    fn test_attributes() {
        let notif = attributes::notification_id(&NotificationId::from("n-1"));
        assert_eq!(notif.key.as_str(), "notification.id");

        let job = attributes::job_id(uuid::Uuid::nil());
        assert_eq!(job.key.as_str(), "delivery.job_id");

        assert_eq!(attributes::channel(ChannelKind::Sms).key.as_str(), "delivery.channel");
        assert_eq!(
            attributes::job_state(JobState::Withdrawn).key.as_str(),
            "delivery.job_state"
        );
    }

    #[test]
    fn test_telemetry_guard_without_provider() {
        let guard = TelemetryGuard { provider: None };
        drop(guard);
    }
}
