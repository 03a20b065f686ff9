//! PostgreSQL-backed delivery store.
//!
//! Documents are stored as JSONB next to the columns the engine queries
//! (`state`, `version`). Creation runs in one transaction; compare-and-swap
//! is an `UPDATE ... WHERE version = $n` with the record insert in the same
//! transaction.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;

use crate::notification::{DeliveryJob, DeliveryRecord, JobId, NotificationId, NotificationRecord};
use crate::postgres::PostgresPool;

use super::{DeliveryStore, StoreError, StoreResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    document JSONB NOT NULL,
    cancelled BOOLEAN NOT NULL DEFAULT FALSE,
    accepted_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS delivery_jobs (
    id UUID PRIMARY KEY,
    notification_id TEXT NOT NULL REFERENCES notifications (id),
    position INTEGER NOT NULL,
    state TEXT NOT NULL,
    version BIGINT NOT NULL,
    document JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_delivery_jobs_notification
    ON delivery_jobs (notification_id, position);

CREATE INDEX IF NOT EXISTS idx_delivery_jobs_active
    ON delivery_jobs (state)
    WHERE state NOT IN ('succeeded', 'permanent_failed', 'withdrawn');

CREATE TABLE IF NOT EXISTS delivery_records (
    seq BIGSERIAL PRIMARY KEY,
    job_id UUID NOT NULL REFERENCES delivery_jobs (id),
    attempt INTEGER NOT NULL,
    document JSONB NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_delivery_records_job
    ON delivery_records (job_id, seq);
"#;

pub struct PostgresDeliveryStore {
    pool: PostgresPool,
}

impl PostgresDeliveryStore {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if missing.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        self.guard(sqlx::raw_sql(SCHEMA).execute(self.pool.pool()).await)?;
        tracing::info!("Delivery store schema ready");
        Ok(())
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.pool.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("PostgreSQL circuit breaker is open".into()))
        }
    }

    /// Feed the circuit breaker and convert the error.
    fn guard<T>(&self, result: Result<T, sqlx::Error>) -> StoreResult<T> {
        match result {
            Ok(value) => {
                self.pool.record_success();
                Ok(value)
            }
            Err(e) => {
                self.pool.record_failure();
                Err(StoreError::Postgres(e))
            }
        }
    }

    async fn insert_all(
        &self,
        record: &NotificationRecord,
        jobs: &[DeliveryJob],
    ) -> Result<bool, sqlx::Error> {
        let document = serde_json::to_value(record).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let mut tx = self.pool.pool().begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO notifications (id, document, cancelled, accepted_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id().as_str())
        .bind(&document)
        .bind(record.cancelled)
        .bind(record.accepted_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for (position, job) in jobs.iter().enumerate() {
            let job_doc = serde_json::to_value(job).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
            sqlx::query(
                r#"
                INSERT INTO delivery_jobs (id, notification_id, position, state, version, document, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(job.id)
            .bind(job.notification_id.as_str())
            .bind(position as i32)
            .bind(job.state.as_str())
            .bind(job.version as i64)
            .bind(&job_doc)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn swap(
        &self,
        expected_version: u64,
        job: &DeliveryJob,
        record: Option<&DeliveryRecord>,
    ) -> Result<bool, sqlx::Error> {
        let job_doc = serde_json::to_value(job).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let mut tx = self.pool.pool().begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = $3, version = $4, document = $5, updated_at = $6
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(job.id)
        .bind(expected_version as i64)
        .bind(job.state.as_str())
        .bind(job.version as i64)
        .bind(&job_doc)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(record) = record {
            let record_doc =
                serde_json::to_value(record).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
            sqlx::query(
                r#"
                INSERT INTO delivery_records (job_id, attempt, document, recorded_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(record.job_id)
            .bind(record.attempt as i32)
            .bind(&record_doc)
            .bind(record.at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

fn decode_jobs(documents: Vec<Value>) -> StoreResult<Vec<DeliveryJob>> {
    documents
        .into_iter()
        .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl DeliveryStore for PostgresDeliveryStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn create_notification(
        &self,
        record: &NotificationRecord,
        jobs: &[DeliveryJob],
    ) -> StoreResult<()> {
        self.check_available()?;
        let created = self.guard(self.insert_all(record, jobs).await)?;
        if !created {
            return Err(StoreError::AlreadyExists(record.id().clone()));
        }

        tracing::debug!(
            notification_id = %record.id(),
            jobs = jobs.len(),
            "Notification stored in PostgreSQL"
        );
        Ok(())
    }

    async fn get_notification(&self, id: &NotificationId) -> StoreResult<Option<NotificationRecord>> {
        self.check_available()?;
        let row = self.guard(
            sqlx::query("SELECT document, cancelled FROM notifications WHERE id = $1")
                .bind(id.as_str())
                .fetch_optional(self.pool.pool())
                .await,
        )?;

        let Some(row) = row else {
            return Ok(None);
        };
        let document: Value = row.try_get("document")?;
        let cancelled: bool = row.try_get("cancelled")?;
        let mut record: NotificationRecord = serde_json::from_value(document)?;
        record.cancelled = cancelled;
        Ok(Some(record))
    }

    async fn mark_cancelled(&self, id: &NotificationId) -> StoreResult<bool> {
        self.check_available()?;
        let result = self.guard(
            sqlx::query("UPDATE notifications SET cancelled = TRUE WHERE id = $1")
                .bind(id.as_str())
                .execute(self.pool.pool())
                .await,
        )?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<DeliveryJob>> {
        self.check_available()?;
        let document: Option<Value> = self.guard(
            sqlx::query_scalar("SELECT document FROM delivery_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(self.pool.pool())
                .await,
        )?;
        document
            .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
            .transpose()
    }

    async fn jobs_for(&self, id: &NotificationId) -> StoreResult<Vec<DeliveryJob>> {
        self.check_available()?;
        let documents: Vec<Value> = self.guard(
            sqlx::query_scalar(
                "SELECT document FROM delivery_jobs WHERE notification_id = $1 ORDER BY position",
            )
            .bind(id.as_str())
            .fetch_all(self.pool.pool())
            .await,
        )?;
        decode_jobs(documents)
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        job: &DeliveryJob,
        record: Option<&DeliveryRecord>,
    ) -> StoreResult<bool> {
        self.check_available()?;
        self.guard(self.swap(expected_version, job, record).await)
    }

    async fn records_for(&self, job_id: JobId) -> StoreResult<Vec<DeliveryRecord>> {
        self.check_available()?;
        let documents: Vec<Value> = self.guard(
            sqlx::query_scalar("SELECT document FROM delivery_records WHERE job_id = $1 ORDER BY seq")
                .bind(job_id)
                .fetch_all(self.pool.pool())
                .await,
        )?;
        documents
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
            .collect()
    }

    async fn active_jobs(&self) -> StoreResult<Vec<DeliveryJob>> {
        self.check_available()?;
        let documents: Vec<Value> = self.guard(
            sqlx::query_scalar(
                r#"
                SELECT document FROM delivery_jobs
                WHERE state NOT IN ('succeeded', 'permanent_failed', 'withdrawn')
                ORDER BY updated_at
                "#,
            )
            .fetch_all(self.pool.pool())
            .await,
        )?;
        decode_jobs(documents)
    }
}
