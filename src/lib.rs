// Infrastructure layer (shared components)
pub mod infrastructure;

// Re-export infrastructure modules at the crate root
pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;
pub use infrastructure::postgres;
pub use infrastructure::redis;

// Domain layer
pub mod notification;
pub mod recipient;
pub mod retry;
pub mod template;
pub mod tracker;
pub mod transport;

// Application layer
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod intake;

// Supporting modules
pub mod shutdown;
pub mod telemetry;
