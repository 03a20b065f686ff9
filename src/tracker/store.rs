//! Storage contract for notifications, jobs and attempt records.
//!
//! Backends (memory, Redis, PostgreSQL) implement [`DeliveryStore`]. Two
//! operations carry the engine's consistency guarantees:
//!
//! - `create_notification` stores the notification and its full job set
//!   atomically, so a partial job set is never visible.
//! - `compare_and_swap` replaces a job only if its stored version matches,
//!   appending the attempt record in the same step.

use async_trait::async_trait;
use thiserror::Error;

use crate::notification::{DeliveryJob, DeliveryRecord, JobId, NotificationId, NotificationRecord};
use crate::postgres::PostgresPoolError;
use crate::redis::PoolError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Notification {0} already exists")]
    AlreadyExists(NotificationId),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend is temporarily unavailable (e.g., circuit breaker open)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt stored data: {0}")]
    Corrupt(String),
}

impl From<PoolError> for StoreError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Redis(e) => StoreError::Redis(e),
            PoolError::CircuitOpen => StoreError::Unavailable("Redis circuit breaker is open".into()),
        }
    }
}

impl From<PostgresPoolError> for StoreError {
    fn from(err: PostgresPoolError) -> Self {
        match err {
            PostgresPoolError::Sqlx(e) => StoreError::Postgres(e),
            PostgresPoolError::CircuitOpen => {
                StoreError::Unavailable("PostgreSQL circuit breaker is open".into())
            }
            PostgresPoolError::MissingUrl => {
                StoreError::Unavailable("PostgreSQL URL not configured".into())
            }
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Backend trait for delivery state.
///
/// Implementations must be thread-safe (`Send + Sync`); they are shared by
/// every dispatch task.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Backend identifier used in logs and metrics
    fn backend_name(&self) -> &'static str;

    /// Persist a notification and its complete job set, all or nothing.
    ///
    /// Fails with `AlreadyExists` when the id was accepted before.
    async fn create_notification(
        &self,
        record: &NotificationRecord,
        jobs: &[DeliveryJob],
    ) -> StoreResult<()>;

    async fn get_notification(&self, id: &NotificationId) -> StoreResult<Option<NotificationRecord>>;

    /// Set the cancelled flag. Returns false for an unknown notification.
    async fn mark_cancelled(&self, id: &NotificationId) -> StoreResult<bool>;

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<DeliveryJob>>;

    /// Jobs of a notification in fan-out order
    async fn jobs_for(&self, id: &NotificationId) -> StoreResult<Vec<DeliveryJob>>;

    /// Replace `job` if the stored version equals `expected_version`,
    /// appending `record` in the same atomic step.
    ///
    /// Returns false when the job is unknown or the version moved on.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        job: &DeliveryJob,
        record: Option<&DeliveryRecord>,
    ) -> StoreResult<bool>;

    /// Attempt records of a job in append order
    async fn records_for(&self, job_id: JobId) -> StoreResult<Vec<DeliveryRecord>>;

    /// Every non-terminal job, for recovery
    async fn active_jobs(&self) -> StoreResult<Vec<DeliveryJob>>;
}
