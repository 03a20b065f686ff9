//! Metrics helper structs for convenient metric recording

use std::time::Instant;

use prometheus::{Encoder, TextEncoder};

use crate::notification::{ChannelKind, JobState};
use crate::redis::CircuitState;

use super::{
    CIRCUIT_BREAKER_STATE, DELIVERY_ATTEMPTS_TOTAL, EVENTS_DROPPED_TOTAL, EVENTS_PUBLISHED_TOTAL,
    INTAKE_MESSAGES_TOTAL, INTAKE_RECONNECTIONS_TOTAL, IN_FLIGHT_SENDS, JOBS_CREATED_TOTAL,
    JOBS_TERMINAL_TOTAL, OUTCOMES_DISCARDED_TOTAL, RECOVERED_JOBS_TOTAL, RETRIES_SCHEDULED_TOTAL,
    RETRIES_WITHDRAWN_TOTAL, RETRY_QUEUE_SIZE, SEND_LATENCY, STORE_ERRORS_TOTAL,
    STORE_OPERATION_LATENCY, SUBMISSIONS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Submission and fan-out metrics
pub struct IntakeMetrics;

impl IntakeMetrics {
    pub fn record_accepted(jobs: &[(ChannelKind, usize)]) {
        SUBMISSIONS_TOTAL.with_label_values(&["accepted"]).inc();
        for (channel, count) in jobs {
            JOBS_CREATED_TOTAL
                .with_label_values(&[channel.as_str()])
                .inc_by(*count as u64);
        }
    }

    pub fn record_duplicate() {
        SUBMISSIONS_TOTAL.with_label_values(&["duplicate"]).inc();
    }

    pub fn record_rejected() {
        SUBMISSIONS_TOTAL.with_label_values(&["rejected"]).inc();
    }

    /// Accepted but terminal at intake (no recipients, render failure)
    pub fn record_intake_failed() {
        SUBMISSIONS_TOTAL.with_label_values(&["intake_failed"]).inc();
    }

    /// Message seen by the pub/sub intake (submitted, malformed, rejected)
    pub fn record_message(outcome: &str) {
        INTAKE_MESSAGES_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn record_reconnection() {
        INTAKE_RECONNECTIONS_TOTAL.inc();
    }
}

/// Per-attempt delivery metrics
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn send_started() {
        IN_FLIGHT_SENDS.inc();
    }

    /// Record a finished send; `outcome` is succeeded, transient or permanent
    pub fn send_finished(channel: ChannelKind, outcome: &str, started: Instant) {
        IN_FLIGHT_SENDS.dec();
        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&[channel.as_str(), outcome])
            .inc();
        SEND_LATENCY
            .with_label_values(&[channel.as_str()])
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn record_terminal(channel: ChannelKind, state: JobState) {
        JOBS_TERMINAL_TOTAL
            .with_label_values(&[channel.as_str(), state.as_str()])
            .inc();
    }

    pub fn record_discarded() {
        OUTCOMES_DISCARDED_TOTAL.inc();
    }

    /// `source` is startup or reconcile
    pub fn record_recovered(source: &str, count: usize) {
        RECOVERED_JOBS_TOTAL
            .with_label_values(&[source])
            .inc_by(count as u64);
    }
}

pub struct RetryMetrics;

impl RetryMetrics {
    pub fn record_scheduled(queue_size: usize) {
        RETRIES_SCHEDULED_TOTAL.inc();
        RETRY_QUEUE_SIZE.set(queue_size as i64);
    }

    pub fn record_withdrawn() {
        RETRIES_WITHDRAWN_TOTAL.inc();
    }

    pub fn set_queue_size(size: usize) {
        RETRY_QUEUE_SIZE.set(size as i64);
    }
}

pub struct EventMetrics;

impl EventMetrics {
    pub fn record_published() {
        EVENTS_PUBLISHED_TOTAL.inc();
    }

    pub fn record_dropped() {
        EVENTS_DROPPED_TOTAL.inc();
    }
}

/// Delivery store metrics, labelled by backend
pub struct StoreMetrics;

impl StoreMetrics {
    pub fn record_operation(backend: &str, operation: &str, started: Instant, success: bool) {
        STORE_OPERATION_LATENCY
            .with_label_values(&[backend, operation])
            .observe(started.elapsed().as_secs_f64());
        if !success {
            STORE_ERRORS_TOTAL
                .with_label_values(&[backend, operation])
                .inc();
        }
    }

    pub fn set_circuit_state(backend: &str, state: CircuitState) {
        CIRCUIT_BREAKER_STATE
            .with_label_values(&[backend])
            .set(state as i64);
    }
}
