//! Retry timing: backoff policy and the retry scheduler.

mod backoff;
mod scheduler;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use scheduler::RetryScheduler;
