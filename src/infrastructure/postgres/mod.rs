//! PostgreSQL persistence module.
//!
//! Provides connection pooling for the PostgreSQL delivery store.

pub mod pool;

pub use pool::{mask_url, PostgresPool, PostgresPoolError};
