//! In-memory delivery store. State lives for the process lifetime only.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::notification::{DeliveryJob, DeliveryRecord, JobId, NotificationId, NotificationRecord};

use super::{DeliveryStore, StoreError, StoreResult};

#[derive(Default)]
pub struct MemoryDeliveryStore {
    notifications: DashMap<NotificationId, NotificationRecord>,
    jobs: DashMap<JobId, DeliveryJob>,
    jobs_by_notification: DashMap<NotificationId, Vec<JobId>>,
    records: DashMap<JobId, Vec<DeliveryRecord>>,
}

impl MemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notification_count(&self) -> usize {
        self.notifications.len()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

#[async_trait]
impl DeliveryStore for MemoryDeliveryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn create_notification(
        &self,
        record: &NotificationRecord,
        jobs: &[DeliveryJob],
    ) -> StoreResult<()> {
        // The vacant entry holds the shard lock until the notification is
        // visible, so concurrent creates with the same id serialize here.
        match self.notifications.entry(record.id().clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(record.id().clone())),
            Entry::Vacant(vacant) => {
                for job in jobs {
                    self.jobs.insert(job.id, job.clone());
                }
                self.jobs_by_notification
                    .insert(record.id().clone(), jobs.iter().map(|j| j.id).collect());
                vacant.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get_notification(&self, id: &NotificationId) -> StoreResult<Option<NotificationRecord>> {
        Ok(self.notifications.get(id).map(|r| r.clone()))
    }

    async fn mark_cancelled(&self, id: &NotificationId) -> StoreResult<bool> {
        match self.notifications.get_mut(id) {
            Some(mut record) => {
                record.cancelled = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<DeliveryJob>> {
        Ok(self.jobs.get(&job_id).map(|j| j.clone()))
    }

    async fn jobs_for(&self, id: &NotificationId) -> StoreResult<Vec<DeliveryJob>> {
        let ids = match self.jobs_by_notification.get(id) {
            Some(ids) => ids.clone(),
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|job_id| self.jobs.get(job_id).map(|j| j.clone()))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        job: &DeliveryJob,
        record: Option<&DeliveryRecord>,
    ) -> StoreResult<bool> {
        let Some(mut current) = self.jobs.get_mut(&job.id) else {
            return Ok(false);
        };
        if current.version != expected_version {
            return Ok(false);
        }
        // Record is appended while the job entry is still locked
        if let Some(record) = record {
            self.records.entry(job.id).or_default().push(record.clone());
        }
        *current = job.clone();
        Ok(true)
    }

    async fn records_for(&self, job_id: JobId) -> StoreResult<Vec<DeliveryRecord>> {
        Ok(self
            .records
            .get(&job_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn active_jobs(&self) -> StoreResult<Vec<DeliveryJob>> {
        // Collect before consulting `notifications`: a create in progress
        // holds a notification shard while inserting jobs.
        let candidates: Vec<DeliveryJob> = self
            .jobs
            .iter()
            .filter(|j| !j.state.is_terminal())
            .map(|j| j.clone())
            .collect();

        Ok(candidates
            .into_iter()
            .filter(|j| self.notifications.contains_key(&j.notification_id))
            .collect())
    }
}
