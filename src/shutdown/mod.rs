//! Graceful shutdown of the delivery engine.
//!
//! Phases, in order:
//! 1. Stop the intake subscriber so no new requests arrive
//! 2. Signal background tasks (scheduler, reconciler, dispatch loop)
//! 3. Drain in-flight attempts within the dispatch drain timeout
//! 4. Flush queued events to their sinks
//!
//! Jobs still queued or running when the drain deadline passes stay in the
//! store and are recovered on the next start.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::dispatch::DrainReport;
use crate::engine::Engine;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for the event queue to flush (default: 5 seconds)
    pub event_flush_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            event_flush_timeout: Duration::from_secs(5),
        }
    }
}

/// Handles graceful shutdown of the delivery engine
pub struct GracefulShutdown {
    engine: Engine,
    intake_shutdown: Option<broadcast::Sender<()>>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            intake_shutdown: None,
            config: ShutdownConfig::default(),
        }
    }

    /// Also stop an intake subscriber first.
    pub fn with_intake(mut self, intake_shutdown: broadcast::Sender<()>) -> Self {
        self.intake_shutdown = Some(intake_shutdown);
        self
    }

    pub fn with_config(mut self, config: ShutdownConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute the shutdown sequence
    #[tracing::instrument(name = "graceful_shutdown", skip(self))]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Stopping intake");
        result.intake_stopped = match &self.intake_shutdown {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        };

        tracing::info!("Phase 2: Signaling background tasks to stop");
        result.pending_retries = self.engine.stop_background().await;

        tracing::info!("Phase 3: Draining in-flight attempts");
        result.drain = self.engine.drain().await;

        tracing::info!("Phase 4: Flushing events");
        result.events_flushed = timeout(self.config.event_flush_timeout, self.engine.flush_events())
            .await
            .is_ok();
        if !result.events_flushed {
            tracing::warn!("Event flush timeout, some events may be lost");
        }

        result.duration = start.elapsed();
        result.success = result.drain.abandoned == 0 && result.events_flushed;

        tracing::info!(
            intake_stopped = result.intake_stopped,
            pending_retries = result.pending_retries,
            attempts_completed = result.drain.completed,
            attempts_abandoned = result.drain.abandoned,
            events_flushed = result.events_flushed,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// No attempt was abandoned and events were flushed
    pub success: bool,
    /// Whether an intake subscriber received the stop signal
    pub intake_stopped: bool,
    /// Retries still scheduled; they are recovered from the store on restart
    pub pending_retries: usize,
    pub drain: DrainReport,
    pub events_flushed: bool,
    /// Total time taken for shutdown
    pub duration: Duration,
}
