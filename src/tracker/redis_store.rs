//! Redis-backed delivery store.
//!
//! Key layout under the configured prefix:
//!
//! - `{prefix}:n:{notification_id}`: notification document (JSON)
//! - `{prefix}:n:{notification_id}:jobs`: job ids in fan-out order (list)
//! - `{prefix}:n:{notification_id}:cancelled`: set once cancelled
//! - `{prefix}:j:{job_id}`: hash with `version` and `data` (job JSON)
//! - `{prefix}:j:{job_id}:records`: attempt records (list of JSON)
//! - `{prefix}:active`: ids of non-terminal jobs (set)
//!
//! Create and compare-and-swap run as Lua scripts so each is atomic.

use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::notification::{DeliveryJob, DeliveryRecord, JobId, NotificationId, NotificationRecord};
use crate::redis::RedisPool;

use super::{DeliveryStore, StoreError, StoreResult};

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
for i = 3, #ARGV, 3 do
    local job_id = ARGV[i]
    redis.call('HSET', ARGV[2] .. job_id, 'version', ARGV[i + 1], 'data', ARGV[i + 2])
    redis.call('RPUSH', KEYS[2], job_id)
    redis.call('SADD', KEYS[3], job_id)
end
redis.call('SET', KEYS[1], ARGV[1])
return 1
"#;

const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current or current ~= ARGV[1] then
    return 0
end
redis.call('HSET', KEYS[1], 'version', ARGV[2], 'data', ARGV[3])
if ARGV[6] ~= '' then
    redis.call('RPUSH', KEYS[2], ARGV[6])
end
if ARGV[4] == '1' then
    redis.call('SREM', KEYS[3], ARGV[5])
else
    redis.call('SADD', KEYS[3], ARGV[5])
end
return 1
"#;

const MARK_CANCELLED_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('SET', KEYS[2], '1')
return 1
"#;

pub struct RedisDeliveryStore {
    pool: Arc<RedisPool>,
    prefix: String,
}

impl RedisDeliveryStore {
    pub fn new(pool: Arc<RedisPool>, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn notification_key(&self, id: &NotificationId) -> String {
        format!("{}:n:{}", self.prefix, id)
    }

    fn notification_jobs_key(&self, id: &NotificationId) -> String {
        format!("{}:n:{}:jobs", self.prefix, id)
    }

    fn cancelled_key(&self, id: &NotificationId) -> String {
        format!("{}:n:{}:cancelled", self.prefix, id)
    }

    fn job_prefix(&self) -> String {
        format!("{}:j:", self.prefix)
    }

    fn job_key(&self, job_id: JobId) -> String {
        format!("{}:j:{}", self.prefix, job_id)
    }

    fn records_key(&self, job_id: JobId) -> String {
        format!("{}:j:{}:records", self.prefix, job_id)
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.prefix)
    }

    async fn load_jobs(&self, job_ids: Vec<String>) -> StoreResult<Vec<DeliveryJob>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = job_ids.iter().map(|id| format!("{}{}", self.job_prefix(), id)).collect();

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hget(key, "data");
        }
        let docs: Vec<Option<String>> = self
            .pool
            .execute(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;

        let mut jobs = Vec::with_capacity(docs.len());
        for (id, doc) in job_ids.iter().zip(docs) {
            match doc {
                Some(doc) => jobs.push(serde_json::from_str(&doc)?),
                None => tracing::warn!(job_id = %id, "Job listed in index but missing from Redis"),
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl DeliveryStore for RedisDeliveryStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn create_notification(
        &self,
        record: &NotificationRecord,
        jobs: &[DeliveryJob],
    ) -> StoreResult<()> {
        let script = redis::Script::new(CREATE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.notification_key(record.id()))
            .key(self.notification_jobs_key(record.id()))
            .key(self.active_key())
            .arg(serde_json::to_string(record)?)
            .arg(self.job_prefix());
        for job in jobs {
            invocation
                .arg(job.id.to_string())
                .arg(job.version)
                .arg(serde_json::to_string(job)?);
        }

        let created: i32 = self
            .pool
            .execute(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await?;

        if created == 0 {
            return Err(StoreError::AlreadyExists(record.id().clone()));
        }

        tracing::debug!(
            notification_id = %record.id(),
            jobs = jobs.len(),
            "Notification stored in Redis"
        );
        Ok(())
    }

    async fn get_notification(&self, id: &NotificationId) -> StoreResult<Option<NotificationRecord>> {
        let mut pipe = redis::pipe();
        pipe.get(self.notification_key(id)).get(self.cancelled_key(id));
        let (raw, cancelled): (Option<String>, Option<String>) = self
            .pool
            .execute(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;

        let Some(doc) = raw else {
            return Ok(None);
        };
        let mut record: NotificationRecord = serde_json::from_str(&doc)?;
        record.cancelled = record.cancelled || cancelled.is_some();
        Ok(Some(record))
    }

    async fn mark_cancelled(&self, id: &NotificationId) -> StoreResult<bool> {
        let script = redis::Script::new(MARK_CANCELLED_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.notification_key(id))
            .key(self.cancelled_key(id));
        let updated: i32 = self
            .pool
            .execute(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(updated == 1)
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<DeliveryJob>> {
        let key = self.job_key(job_id);
        let raw: Option<String> = self
            .pool
            .execute(|mut conn| async move { conn.hget(&key, "data").await })
            .await?;
        raw.map(|doc| serde_json::from_str(&doc).map_err(StoreError::from))
            .transpose()
    }

    async fn jobs_for(&self, id: &NotificationId) -> StoreResult<Vec<DeliveryJob>> {
        let key = self.notification_jobs_key(id);
        let job_ids: Vec<String> = self
            .pool
            .execute(|mut conn| async move { conn.lrange(&key, 0, -1).await })
            .await?;
        self.load_jobs(job_ids).await
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        job: &DeliveryJob,
        record: Option<&DeliveryRecord>,
    ) -> StoreResult<bool> {
        let record_doc = record.map(serde_json::to_string).transpose()?.unwrap_or_default();
        let job_doc = serde_json::to_string(job)?;

        let script = redis::Script::new(CAS_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.job_key(job.id))
            .key(self.records_key(job.id))
            .key(self.active_key())
            .arg(expected_version.to_string())
            .arg(job.version.to_string())
            .arg(job_doc)
            .arg(if job.state.is_terminal() { "1" } else { "0" })
            .arg(job.id.to_string())
            .arg(record_doc);

        let swapped: i32 = self
            .pool
            .execute(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(swapped == 1)
    }

    async fn records_for(&self, job_id: JobId) -> StoreResult<Vec<DeliveryRecord>> {
        let key = self.records_key(job_id);
        let docs: Vec<String> = self
            .pool
            .execute(|mut conn| async move { conn.lrange(&key, 0, -1).await })
            .await?;
        docs.iter()
            .map(|doc| serde_json::from_str(doc).map_err(StoreError::from))
            .collect()
    }

    async fn active_jobs(&self) -> StoreResult<Vec<DeliveryJob>> {
        let key = self.active_key();
        let job_ids: Vec<String> = self
            .pool
            .execute(|mut conn| async move { conn.smembers(&key).await })
            .await?;
        let jobs = self.load_jobs(job_ids).await?;
        Ok(jobs.into_iter().filter(|j| !j.state.is_terminal()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::redis::CircuitBreaker;

    fn store() -> RedisDeliveryStore {
        let config = RedisConfig {
            url: "redis://127.0.0.1:6379".into(),
            key_prefix: "test:delivery".into(),
        };
        let pool = RedisPool::new(config, Arc::new(CircuitBreaker::new("redis"))).unwrap();
        RedisDeliveryStore::new(Arc::new(pool), "test:delivery")
    }

    #[test]
    fn test_key_layout() {
        let store = store();
        let id = NotificationId::from("order-42");
        let job_id = uuid::Uuid::nil();

        assert_eq!(store.notification_key(&id), "test:delivery:n:order-42");
        assert_eq!(store.notification_jobs_key(&id), "test:delivery:n:order-42:jobs");
        assert_eq!(store.cancelled_key(&id), "test:delivery:n:order-42:cancelled");
        assert_eq!(
            store.job_key(job_id),
            format!("{}{}", store.job_prefix(), job_id)
        );
        assert_eq!(
            store.records_key(job_id),
            "test:delivery:j:00000000-0000-0000-0000-000000000000:records"
        );
        assert_eq!(store.active_key(), "test:delivery:active");
    }
}
