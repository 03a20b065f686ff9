//! Delivery store factory

use std::sync::Arc;

use crate::config::{Settings, StoreBackend, StoreSettings};
use crate::postgres::PostgresPool;
use crate::redis::{CircuitBreaker, CircuitBreakerConfig, RedisPool};

use super::{DeliveryStore, MemoryDeliveryStore, PostgresDeliveryStore, RedisDeliveryStore};

fn breaker(name: &'static str, settings: &StoreSettings) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::with_config(
        name,
        CircuitBreakerConfig {
            failure_threshold: settings.circuit_failure_threshold,
            reset_timeout_ms: settings.circuit_reset_timeout_ms,
            ..CircuitBreakerConfig::default()
        },
    ))
}

/// Create a delivery store based on configuration.
///
/// Returns the appropriate backend for the `store.backend` setting:
/// - `"postgres"`: a `PostgresDeliveryStore` if a pool is provided and the
///   schema can be created
/// - `"redis"`: a `RedisDeliveryStore` if a pool is provided
/// - `"memory"` (default): a `MemoryDeliveryStore`
///
/// A requested backend that cannot be used falls back to memory with a
/// warning.
pub async fn create_delivery_store(
    settings: &StoreSettings,
    key_prefix: &str,
    redis_pool: Option<Arc<RedisPool>>,
    postgres_pool: Option<PostgresPool>,
) -> Arc<dyn DeliveryStore> {
    match settings.backend {
        StoreBackend::Postgres => {
            if let Some(pool) = postgres_pool {
                tracing::info!(
                    backend = "postgres",
                    url = %pool.database_url_masked(),
                    "Creating PostgreSQL delivery store"
                );
                let store = PostgresDeliveryStore::new(pool);
                match store.ensure_schema().await {
                    Ok(()) => return Arc::new(store),
                    Err(e) => tracing::warn!(
                        error = %e,
                        "PostgreSQL schema setup failed, falling back to memory"
                    ),
                }
            } else {
                tracing::warn!(
                    "PostgreSQL backend requested but no pool provided, falling back to memory"
                );
            }
            Arc::new(MemoryDeliveryStore::new())
        }
        StoreBackend::Redis => {
            if let Some(pool) = redis_pool {
                tracing::info!(
                    backend = "redis",
                    url = %pool.url_masked(),
                    prefix = %key_prefix,
                    "Creating Redis delivery store"
                );
                Arc::new(RedisDeliveryStore::new(pool, key_prefix))
            } else {
                tracing::warn!("Redis backend requested but no pool provided, falling back to memory");
                Arc::new(MemoryDeliveryStore::new())
            }
        }
        StoreBackend::Memory => {
            tracing::info!(backend = "memory", "Creating in-memory delivery store");
            Arc::new(MemoryDeliveryStore::new())
        }
    }
}

/// Open the pool the configured backend needs, then build the store.
pub async fn connect_delivery_store(settings: &Settings) -> Arc<dyn DeliveryStore> {
    let (redis_pool, postgres_pool) = match settings.store.backend {
        StoreBackend::Redis => {
            match RedisPool::new(settings.redis.clone(), breaker("redis", &settings.store)) {
                Ok(pool) => {
                    if let Err(e) = pool.ping().await {
                        tracing::warn!(error = %e, "Redis not reachable at start-up");
                    }
                    (Some(Arc::new(pool)), None)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create Redis pool");
                    (None, None)
                }
            }
        }
        StoreBackend::Postgres => {
            match PostgresPool::new(&settings.database, breaker("postgres", &settings.store)).await {
                Ok(pool) => (None, Some(pool)),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create PostgreSQL pool");
                    (None, None)
                }
            }
        }
        StoreBackend::Memory => (None, None),
    };

    create_delivery_store(
        &settings.store,
        &settings.redis.key_prefix,
        redis_pool,
        postgres_pool,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_by_default() {
        let store = connect_delivery_store(&Settings::default()).await;
        assert_eq!(store.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_missing_pool_falls_back_to_memory() {
        for backend in [StoreBackend::Redis, StoreBackend::Postgres] {
            let settings = StoreSettings {
                backend,
                ..StoreSettings::default()
            };
            let store = create_delivery_store(&settings, "test", None, None).await;
            assert_eq!(store.backend_name(), "memory");
        }
    }

    #[tokio::test]
    async fn test_postgres_without_url_falls_back() {
        let mut settings = Settings::default();
        settings.store.backend = StoreBackend::Postgres;
        let store = connect_delivery_store(&settings).await;
        assert_eq!(store.backend_name(), "memory");
    }
}
