//! Prometheus metrics for the delivery engine.
//!
//! - Intake metrics (submissions by result, jobs created per channel)
//! - Delivery metrics (attempts, outcomes, send latency, terminal states)
//! - Retry scheduler metrics
//! - Event bus metrics
//! - Store metrics (operation latency, errors, circuit breaker state)
//!
//! Exposition is left to the embedding process through [`encode_metrics`].

mod helpers;

pub use helpers::{
    encode_metrics, DeliveryMetrics, EventMetrics, IntakeMetrics, RetryMetrics, StoreMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_delivery";

lazy_static! {
    // ============================================================================
    // Intake Metrics
    // ============================================================================

    /// Submissions by result (accepted, duplicate, rejected, intake_failed)
    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_submissions_total", METRIC_PREFIX),
        "Total notification submissions by result",
        &["result"]
    ).unwrap();

    pub static ref JOBS_CREATED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_created_total", METRIC_PREFIX),
        "Total delivery jobs created",
        &["channel"]
    ).unwrap();

    /// Messages received by the Redis intake subscriber
    pub static ref INTAKE_MESSAGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_intake_messages_total", METRIC_PREFIX),
        "Total intake messages by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref INTAKE_RECONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_intake_reconnections_total", METRIC_PREFIX),
        "Total intake subscriber reconnection attempts"
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_attempts_total", METRIC_PREFIX),
        "Total delivery attempts by channel and outcome",
        &["channel", "outcome"]
    ).unwrap();

    pub static ref SEND_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_send_latency_seconds", METRIC_PREFIX),
        "Transport send latency in seconds",
        &["channel"],
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    pub static ref JOBS_TERMINAL_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_terminal_total", METRIC_PREFIX),
        "Jobs reaching a terminal state",
        &["channel", "state"]
    ).unwrap();

    /// Outcomes that lost the compare-and-swap (job withdrawn or changed meanwhile)
    pub static ref OUTCOMES_DISCARDED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_outcomes_discarded_total", METRIC_PREFIX),
        "Send outcomes discarded because the job changed concurrently"
    ).unwrap();

    pub static ref IN_FLIGHT_SENDS: IntGauge = register_int_gauge!(
        format!("{}_in_flight_sends", METRIC_PREFIX),
        "Transport sends currently in progress"
    ).unwrap();

    pub static ref RECOVERED_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_recovered_jobs_total", METRIC_PREFIX),
        "Jobs re-dispatched by recovery and reconciliation",
        &["source"]
    ).unwrap();

    // ============================================================================
    // Retry Metrics
    // ============================================================================

    pub static ref RETRIES_SCHEDULED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_retries_scheduled_total", METRIC_PREFIX),
        "Total retries handed to the scheduler"
    ).unwrap();

    pub static ref RETRIES_WITHDRAWN_TOTAL: IntCounter = register_int_counter!(
        format!("{}_retries_withdrawn_total", METRIC_PREFIX),
        "Scheduled retries dropped because their job was withdrawn"
    ).unwrap();

    pub static ref RETRY_QUEUE_SIZE: IntGauge = register_int_gauge!(
        format!("{}_retry_queue_size", METRIC_PREFIX),
        "Jobs waiting in the retry scheduler"
    ).unwrap();

    // ============================================================================
    // Event Metrics
    // ============================================================================

    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_events_published_total", METRIC_PREFIX),
        "Total state-transition events published"
    ).unwrap();

    pub static ref EVENTS_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_events_dropped_total", METRIC_PREFIX),
        "Events dropped because the event queue was full"
    ).unwrap();

    // ============================================================================
    // Store Metrics
    // ============================================================================

    pub static ref STORE_OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_store_operation_latency_seconds", METRIC_PREFIX),
        "Delivery store operation latency in seconds",
        &["backend", "operation"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_store_errors_total", METRIC_PREFIX),
        "Delivery store operation errors",
        &["backend", "operation"]
    ).unwrap();

    /// 0=closed, 1=open, 2=half-open
    pub static ref CIRCUIT_BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_circuit_breaker_state", METRIC_PREFIX),
        "Store circuit breaker state (0=closed, 1=open, 2=half-open)",
        &["backend"]
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        SUBMISSIONS_TOTAL.with_label_values(&["accepted"]).inc();

        let output = encode_metrics().unwrap();
        assert!(output.contains("ara_delivery_submissions_total"));
    }

    #[test]
    fn test_delivery_metrics() {
        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&["email", "succeeded"])
            .inc();
        SEND_LATENCY.with_label_values(&["email"]).observe(0.02);
        IN_FLIGHT_SENDS.inc();
        IN_FLIGHT_SENDS.dec();
    }

    #[test]
    fn test_store_metrics() {
        STORE_OPERATION_LATENCY
            .with_label_values(&["memory", "get_job"])
            .observe(0.0001);
        STORE_ERRORS_TOTAL.with_label_values(&["redis", "cas"]).inc();
        CIRCUIT_BREAKER_STATE.with_label_values(&["redis"]).set(0);
    }
}
