use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;

use crate::events::{DeliveryEvent, EventBus};
use crate::metrics::{DeliveryMetrics, StoreMetrics};
use crate::notification::{
    DeliveryJob, DeliveryRecord, JobId, NotificationId, NotificationRecord, NotificationReport,
    NotificationStatus,
};

use super::{DeliveryStore, StoreResult};

/// Withdrawal gives up after this many lost compare-and-swap rounds.
const WITHDRAW_MAX_ROUNDS: usize = 8;

/// Durable delivery state plus transition events.
///
/// Every job change goes through [`DeliveryTracker::transition`], a
/// compare-and-swap on the job version. Successful transitions publish a
/// `JobTransition` event and, when the aggregate moves, a
/// `NotificationStatusChanged` event.
#[derive(Clone)]
pub struct DeliveryTracker {
    store: Arc<dyn DeliveryStore>,
    events: EventBus,
    last_status: Arc<DashMap<NotificationId, NotificationStatus>>,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn DeliveryStore>, events: EventBus) -> Self {
        Self {
            store,
            events,
            last_status: Arc::new(DashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    async fn observe<T, F>(&self, operation: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let started = Instant::now();
        let result = fut.await;
        StoreMetrics::record_operation(self.store.backend_name(), operation, started, result.is_ok());
        if let Err(e) = &result {
            tracing::warn!(
                backend = self.store.backend_name(),
                operation = operation,
                error = %e,
                "Delivery store operation failed"
            );
        }
        result
    }

    /// Persist an accepted notification with its job set.
    pub async fn accept(&self, record: &NotificationRecord, jobs: &[DeliveryJob]) -> StoreResult<()> {
        self.observe("create", self.store.create_notification(record, jobs))
            .await?;

        for job in jobs {
            self.events
                .publish(DeliveryEvent::job_transition(record.id(), job.id, None, job.state))
                .await;
        }

        let status = record.status_of(jobs);
        if !status.is_terminal() {
            self.last_status.insert(record.id().clone(), status);
        }
        self.events
            .publish(DeliveryEvent::status_changed(record.id(), None, status))
            .await;
        Ok(())
    }

    pub async fn notification(&self, id: &NotificationId) -> StoreResult<Option<NotificationRecord>> {
        self.observe("get_notification", self.store.get_notification(id))
            .await
    }

    pub async fn job(&self, job_id: JobId) -> StoreResult<Option<DeliveryJob>> {
        self.observe("get_job", self.store.get_job(job_id)).await
    }

    pub async fn jobs(&self, id: &NotificationId) -> StoreResult<Vec<DeliveryJob>> {
        self.observe("jobs_for", self.store.jobs_for(id)).await
    }

    pub async fn records(&self, job_id: JobId) -> StoreResult<Vec<DeliveryRecord>> {
        self.observe("records_for", self.store.records_for(job_id))
            .await
    }

    pub async fn active_jobs(&self) -> StoreResult<Vec<DeliveryJob>> {
        self.observe("active_jobs", self.store.active_jobs()).await
    }

    pub async fn mark_cancelled(&self, id: &NotificationId) -> StoreResult<bool> {
        self.observe("mark_cancelled", self.store.mark_cancelled(id))
            .await
    }

    /// Aggregate status, derived from the current job states.
    pub async fn status(&self, id: &NotificationId) -> StoreResult<Option<NotificationStatus>> {
        let Some(record) = self.notification(id).await? else {
            return Ok(None);
        };
        let jobs = self.jobs(id).await?;
        Ok(Some(record.status_of(&jobs)))
    }

    pub async fn report(&self, id: &NotificationId) -> StoreResult<Option<NotificationReport>> {
        let Some(record) = self.notification(id).await? else {
            return Ok(None);
        };
        let jobs = self.jobs(id).await?;
        Ok(Some(NotificationReport::new(record, jobs)))
    }

    /// Replace `current` with `next` if nobody else moved the job first.
    ///
    /// Returns the stored job on success and `None` when the swap lost.
    pub async fn transition(
        &self,
        current: &DeliveryJob,
        next: DeliveryJob,
        record: Option<DeliveryRecord>,
    ) -> StoreResult<Option<DeliveryJob>> {
        let swapped = self
            .observe(
                "compare_and_swap",
                self.store
                    .compare_and_swap(current.version, &next, record.as_ref()),
            )
            .await?;

        if !swapped {
            tracing::debug!(
                job_id = %current.id,
                expected_version = current.version,
                "Job transition lost compare-and-swap"
            );
            return Ok(None);
        }

        if next.state != current.state {
            self.events
                .publish(DeliveryEvent::job_transition(
                    &next.notification_id,
                    next.id,
                    Some(current.state),
                    next.state,
                ))
                .await;
            if next.state.is_terminal() {
                DeliveryMetrics::record_terminal(next.channel, next.state);
            }
            self.refresh_status(&next.notification_id).await;
        }

        Ok(Some(next))
    }

    /// Move a job to `Withdrawn` unless it is already terminal.
    ///
    /// Retries the compare-and-swap against concurrent updates; an in-flight
    /// attempt that completes later loses its own swap and is discarded.
    pub async fn withdraw(&self, job_id: JobId) -> StoreResult<Option<DeliveryJob>> {
        for _ in 0..WITHDRAW_MAX_ROUNDS {
            let Some(job) = self.job(job_id).await? else {
                return Ok(None);
            };
            if job.state.is_terminal() {
                return Ok(None);
            }
            let next = job.withdraw(Utc::now());
            if let Some(stored) = self.transition(&job, next, None).await? {
                return Ok(Some(stored));
            }
        }

        tracing::warn!(job_id = %job_id, "Gave up withdrawing job after repeated conflicts");
        Ok(None)
    }

    async fn refresh_status(&self, id: &NotificationId) {
        let jobs = match self.jobs(id).await {
            Ok(jobs) => jobs,
            Err(_) => return,
        };
        let status = NotificationStatus::derive(jobs.iter().map(|j| j.state), false);

        let previous = if status.is_terminal() {
            self.last_status.remove(id).map(|(_, s)| s)
        } else {
            self.last_status.insert(id.clone(), status)
        };

        if previous != Some(status) {
            self.events
                .publish(DeliveryEvent::status_changed(id, previous, status))
                .await;
        }
    }
}
