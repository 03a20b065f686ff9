//! Redis connectivity for the durable store.
//!
//! # Modules
//!
//! - `CircuitBreaker`: fails fast while a store backend is unavailable
//!   (shared with the PostgreSQL pool)
//! - `pool`: multiplexed connection used by the Redis delivery store

mod circuit_breaker;
pub mod pool;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use pool::{PoolError, RedisPool};

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
