//! Delivery tracking: durable notification, job and attempt-record state.

mod delivery_tracker;
mod factory;
mod memory;
mod postgres_store;
mod redis_store;
mod store;

pub use delivery_tracker::DeliveryTracker;
pub use factory::{connect_delivery_store, create_delivery_store};
pub use memory::MemoryDeliveryStore;
pub use postgres_store::PostgresDeliveryStore;
pub use redis_store::RedisDeliveryStore;
pub use store::{DeliveryStore, StoreError, StoreResult};
