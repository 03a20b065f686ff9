//! Dispatch orchestration: intake, fan-out, attempts, cancellation and
//! recovery.

mod dispatcher;
mod recovery;
mod render_cache;
mod stats;

use std::time::Duration;

use crate::config::Settings;
use crate::retry::BackoffPolicy;

pub use dispatcher::Dispatcher;
pub use render_cache::RenderCache;
pub use stats::{DispatcherStats, DispatcherStatsSnapshot, DrainReport, RecoveryReport};

/// Dispatcher tuning, derived from [`Settings`]
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_attempts: u32,
    pub queue_capacity: usize,
    pub drain_timeout: Duration,
    pub default_locale: String,
    pub backoff: BackoffPolicy,
    /// InFlight jobs untouched this long are re-dispatched by the reconciler
    pub stale_in_flight: Duration,
}

impl DispatcherConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.dispatch.max_attempts,
            queue_capacity: settings.dispatch.queue_capacity,
            drain_timeout: settings.dispatch.drain_timeout(),
            default_locale: settings.dispatch.default_locale.clone(),
            backoff: BackoffPolicy::from_settings(&settings.retry),
            stale_in_flight: Duration::from_secs(settings.recovery.stale_in_flight_seconds),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}
