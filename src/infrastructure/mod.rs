//! Infrastructure layer modules
//!
//! Shared components the delivery engine is built on:
//! - `config`: layered settings
//! - `error`: submit and engine error types
//! - `metrics`: Prometheus metrics helpers
//! - `postgres`: PostgreSQL connection pool
//! - `redis`: Redis connection and the store circuit breaker

pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
pub mod redis;
