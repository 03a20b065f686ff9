use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{EngineError, SubmitError};
use crate::metrics::{DeliveryMetrics, IntakeMetrics};
use crate::notification::{
    ChannelKind, DeliveryJob, DeliveryRecord, IntakeFailure, JobId, JobState, NotificationId,
    NotificationRecord, NotificationReport, NotificationRequest, NotificationStatus,
};
use crate::recipient::{RecipientResolver, ResolveError};
use crate::retry::RetryScheduler;
use crate::template::{RenderedContent, TemplateError, TemplateStore};
use crate::tracker::{DeliveryTracker, StoreError, StoreResult};
use crate::transport::{SendOutcome, TransportRegistry};

use super::render_cache::RenderKey;
use super::{DispatcherConfig, DispatcherStats, DispatcherStatsSnapshot, DrainReport, RenderCache};

pub(super) struct DispatcherInner {
    pub(super) config: DispatcherConfig,
    pub(super) tracker: DeliveryTracker,
    templates: Arc<TemplateStore>,
    resolver: RecipientResolver,
    transports: Arc<TransportRegistry>,
    pub(super) scheduler: Arc<RetryScheduler>,
    render_cache: RenderCache,
    work_tx: mpsc::Sender<JobId>,
    work_rx: Mutex<Option<mpsc::Receiver<JobId>>>,
    /// Jobs with an attempt running in this process
    pub(super) in_progress: DashSet<JobId>,
    pub(super) stats: DispatcherStats,
}

/// Accepts notifications, fans them out into jobs and drives each job
/// through its attempts.
///
/// Cloning is cheap; clones share the same queues and state.
#[derive(Clone)]
pub struct Dispatcher {
    pub(super) inner: Arc<DispatcherInner>,
}

/// Clears the in-progress marker when an attempt task ends
struct InProgressGuard<'a> {
    set: &'a DashSet<JobId>,
    job_id: JobId,
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.job_id);
    }
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        tracker: DeliveryTracker,
        templates: Arc<TemplateStore>,
        resolver: RecipientResolver,
        transports: Arc<TransportRegistry>,
        scheduler: Arc<RetryScheduler>,
    ) -> Self {
        let (work_tx, work_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                tracker,
                templates,
                resolver,
                transports,
                scheduler,
                render_cache: RenderCache::new(),
                work_tx,
                work_rx: Mutex::new(Some(work_rx)),
                in_progress: DashSet::new(),
                stats: DispatcherStats::default(),
            }),
        }
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.inner.tracker
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.inner.templates
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.inner.scheduler
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Sender for jobs due for an attempt (used by the retry scheduler).
    pub fn work_sender(&self) -> mpsc::Sender<JobId> {
        self.inner.work_tx.clone()
    }

    /// Accept a notification request and fan it out into delivery jobs.
    ///
    /// Errors returned here mean nothing was stored. Once an id is returned,
    /// every later failure is only visible through [`Dispatcher::status`].
    #[tracing::instrument(
        name = "dispatcher.submit",
        skip(self, request),
        fields(
            notification_id = %request.id,
            template_id = %request.template_id,
            target_type = request.target.kind()
        )
    )]
    pub async fn submit(&self, request: NotificationRequest) -> Result<NotificationId, SubmitError> {
        let request = request.normalized().map_err(|e| self.rejected(e))?;

        if let Some(status) = self.inner.tracker.status(&request.id).await? {
            DispatcherStats::incr(&self.inner.stats.duplicates);
            IntakeMetrics::record_duplicate();
            return Err(SubmitError::DuplicateRequest {
                notification_id: request.id,
                status,
            });
        }

        if !self.inner.templates.exists(&request.template_id) {
            return Err(self.rejected(SubmitError::InvalidTemplate(format!(
                "unknown template '{}'",
                request.template_id
            ))));
        }

        let resolved = match self
            .inner
            .resolver
            .resolve(&request.target, &request.channels, request.delivery_mode)
            .await
        {
            Ok(resolved) => resolved,
            Err(ResolveError::InvalidTarget(reason)) => {
                return Err(self.rejected(SubmitError::InvalidTarget(reason)));
            }
            Err(ResolveError::NoEligibleRecipients) => {
                return self
                    .accept_failed(request, IntakeFailure::NoEligibleRecipients)
                    .await;
            }
        };

        // Render once per (channel, locale), not per recipient
        let mut rendered: HashMap<RenderKey, Arc<RenderedContent>> = HashMap::new();
        let mut jobs = Vec::with_capacity(resolved.len());
        for recipient in resolved {
            let locale = request
                .locale
                .clone()
                .or(recipient.locale)
                .unwrap_or_else(|| self.inner.config.default_locale.clone());

            let key = (recipient.channel, locale.clone());
            if !rendered.contains_key(&key) {
                match self.inner.templates.render(
                    &request.template_id,
                    recipient.channel,
                    &locale,
                    &request.payload,
                ) {
                    Ok(content) => {
                        rendered.insert(key, Arc::new(content));
                    }
                    Err(e) => {
                        return self
                            .accept_failed(request, IntakeFailure::Render(e.to_string()))
                            .await;
                    }
                }
            }

            jobs.push(DeliveryJob::new(
                request.id.clone(),
                recipient.recipient_id,
                recipient.channel,
                recipient.address,
                locale,
            ));
        }

        let record = NotificationRecord::accepted(request);
        let id = record.id().clone();
        match self.inner.tracker.accept(&record, &jobs).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(existing)) => return Err(self.duplicate(existing).await),
            Err(e) => return Err(e.into()),
        }

        self.inner.render_cache.insert_all(id.clone(), rendered);

        let mut per_channel: HashMap<ChannelKind, usize> = HashMap::new();
        for job in &jobs {
            *per_channel.entry(job.channel).or_default() += 1;
        }
        IntakeMetrics::record_accepted(&per_channel.into_iter().collect::<Vec<_>>());
        DispatcherStats::incr(&self.inner.stats.accepted);
        self.inner
            .stats
            .jobs_created
            .fetch_add(jobs.len() as u64, Ordering::Relaxed);

        tracing::info!(
            notification_id = %id,
            jobs = jobs.len(),
            "Notification accepted"
        );

        for job in &jobs {
            self.enqueue(job.id).await;
        }

        Ok(id)
    }

    fn rejected(&self, error: SubmitError) -> SubmitError {
        DispatcherStats::incr(&self.inner.stats.rejected);
        IntakeMetrics::record_rejected();
        tracing::debug!(error = %error, "Notification request rejected");
        error
    }

    async fn duplicate(&self, id: NotificationId) -> SubmitError {
        DispatcherStats::incr(&self.inner.stats.duplicates);
        IntakeMetrics::record_duplicate();
        match self.inner.tracker.status(&id).await {
            Ok(status) => SubmitError::DuplicateRequest {
                notification_id: id,
                status: status.unwrap_or(NotificationStatus::Pending),
            },
            Err(e) => SubmitError::Store(e),
        }
    }

    /// Store an accepted notification that is terminal before any job exists.
    async fn accept_failed(
        &self,
        request: NotificationRequest,
        failure: IntakeFailure,
    ) -> Result<NotificationId, SubmitError> {
        let record = NotificationRecord::failed_at_intake(request, failure);
        let id = record.id().clone();

        match self.inner.tracker.accept(&record, &[]).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(existing)) => return Err(self.duplicate(existing).await),
            Err(e) => return Err(e.into()),
        }

        DispatcherStats::incr(&self.inner.stats.accepted);
        DispatcherStats::incr(&self.inner.stats.intake_failed);
        IntakeMetrics::record_intake_failed();
        tracing::info!(
            notification_id = %id,
            reason = %record.intake_failure.as_ref().map(|f| f.to_string()).unwrap_or_default(),
            "Notification accepted as failed, no jobs created"
        );
        Ok(id)
    }

    pub async fn status(&self, id: &NotificationId) -> Result<NotificationStatus, EngineError> {
        self.inner
            .tracker
            .status(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub async fn report(&self, id: &NotificationId) -> Result<NotificationReport, EngineError> {
        self.inner
            .tracker
            .report(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Attempt history of one job, in append order.
    pub async fn records(&self, job_id: JobId) -> Result<Vec<DeliveryRecord>, EngineError> {
        if self.inner.tracker.job(job_id).await?.is_none() {
            return Err(EngineError::NotFound(job_id.to_string()));
        }
        Ok(self.inner.tracker.records(job_id).await?)
    }

    /// Cancel a notification, withdrawing every job that is not terminal.
    ///
    /// A terminal notification is left untouched and its status returned.
    #[tracing::instrument(name = "dispatcher.cancel", skip(self), fields(notification_id = %id))]
    pub async fn cancel(&self, id: &NotificationId) -> Result<NotificationStatus, EngineError> {
        let status = self.status(id).await?;
        if status.is_terminal() {
            tracing::debug!(status = %status, "Cancel ignored for terminal notification");
            return Ok(status);
        }

        self.inner.tracker.mark_cancelled(id).await?;

        let mut withdrawn = 0usize;
        for job in self.inner.tracker.jobs(id).await? {
            if job.state.is_terminal() {
                continue;
            }
            self.inner.scheduler.withdraw(job.id);
            if self.inner.tracker.withdraw(job.id).await?.is_some() {
                withdrawn += 1;
            }
        }

        DispatcherStats::incr(&self.inner.stats.cancelled);
        let status = self.status(id).await?;
        if status.is_terminal() {
            self.inner.render_cache.evict(id);
        }
        tracing::info!(withdrawn = withdrawn, status = %status, "Notification cancelled");
        Ok(status)
    }

    pub(super) async fn enqueue(&self, job_id: JobId) -> bool {
        if self.inner.work_tx.send(job_id).await.is_err() {
            tracing::warn!(job_id = %job_id, "Work queue closed, job left for recovery");
            return false;
        }
        true
    }

    /// Start the dispatch loop. Returns `None` if it is already running.
    ///
    /// On shutdown the loop stops taking work and waits up to the drain
    /// timeout for running attempts; jobs still queued or running after
    /// that are picked up by recovery on the next start.
    pub fn start(&self, shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<DrainReport>> {
        let rx = self
            .inner
            .work_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        let dispatcher = self.clone();
        Some(tokio::spawn(dispatcher.run(rx, shutdown)))
    }

    async fn run(self, mut rx: mpsc::Receiver<JobId>, mut shutdown: broadcast::Receiver<()>) -> DrainReport {
        let mut attempts: JoinSet<()> = JoinSet::new();
        let mut report = DrainReport::default();
        tracing::info!("Dispatch loop started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Delivery attempt task failed");
                    }
                    report.completed += 1;
                }
                job = rx.recv() => match job {
                    Some(job_id) => {
                        let dispatcher = self.clone();
                        attempts.spawn(async move { dispatcher.run_attempt(job_id).await });
                    }
                    None => break,
                },
            }
        }

        rx.close();
        let mut left_queued = 0usize;
        while rx.try_recv().is_ok() {
            left_queued += 1;
        }

        let running = attempts.len();
        tracing::info!(
            running = running,
            left_queued = left_queued,
            "Dispatch loop stopping, draining attempts"
        );

        let drained = tokio::time::timeout(self.inner.config.drain_timeout, async {
            let mut completed = 0usize;
            while let Some(joined) = attempts.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Delivery attempt task failed");
                }
                completed += 1;
            }
            completed
        })
        .await;

        match drained {
            Ok(completed) => report.completed += completed,
            Err(_) => {
                report.abandoned = attempts.len();
                attempts.abort_all();
                tracing::warn!(
                    abandoned = report.abandoned,
                    "Drain timeout reached, remaining attempts left for recovery"
                );
            }
        }

        tracing::info!(
            completed = report.completed,
            abandoned = report.abandoned,
            "Dispatch loop stopped"
        );
        report
    }

    /// Run one attempt for `job_id`, unless one is already running here.
    #[tracing::instrument(name = "dispatcher.attempt", skip_all, fields(job_id = %job_id))]
    pub(crate) async fn run_attempt(&self, job_id: JobId) {
        if !self.inner.in_progress.insert(job_id) {
            tracing::debug!("Attempt already running, skipping");
            return;
        }
        let _guard = InProgressGuard {
            set: &self.inner.in_progress,
            job_id,
        };

        if let Err(e) = self.attempt(job_id).await {
            tracing::warn!(error = %e, "Attempt interrupted by store error, job left for recovery");
        }
    }

    async fn attempt(&self, job_id: JobId) -> StoreResult<()> {
        let tracker = &self.inner.tracker;
        let config = &self.inner.config;

        let Some(job) = tracker.job(job_id).await? else {
            tracing::warn!("Job not found");
            return Ok(());
        };
        if job.state.is_terminal() {
            tracing::debug!(state = %job.state, "Job already terminal");
            return Ok(());
        }
        if job.state == JobState::TransientFailed
            && job.next_attempt_at.is_some_and(|at| at > Utc::now())
        {
            tracing::debug!("Retry not yet due");
            return Ok(());
        }

        let Some(record) = tracker.notification(&job.notification_id).await? else {
            tracing::warn!(notification_id = %job.notification_id, "Job without notification");
            return Ok(());
        };
        if record.cancelled {
            tracker.withdraw(job.id).await?;
            return Ok(());
        }

        if job.state != JobState::InFlight && job.attempts >= config.max_attempts {
            self.finish(&job, job.exhaust(Utc::now())).await?;
            return Ok(());
        }

        let content = match self.content_for(&record, &job) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(error = %e, "Content could not be rendered, failing job");
                self.finish(&job, job.fail_render(e.to_string(), Utc::now()))
                    .await?;
                return Ok(());
            }
        };

        // The job only turns InFlight once it holds a send slot
        let permit = self.inner.transports.acquire(job.channel).await;

        let Some(in_flight) = tracker
            .transition(&job, job.begin_attempt(Utc::now()), None)
            .await?
        else {
            return Ok(());
        };
        DispatcherStats::incr(&self.inner.stats.attempts);

        let outcome = match permit {
            Ok(permit) => {
                self.inner
                    .transports
                    .send_with(permit, &in_flight.address, &content)
                    .await
            }
            Err(outcome) => outcome,
        };

        let (next, attempt_record) = in_flight.complete_attempt(
            &outcome,
            config.max_attempts,
            &config.backoff,
            Utc::now(),
        );

        match tracker.transition(&in_flight, next, Some(attempt_record)).await {
            Ok(Some(stored)) => {
                self.after_attempt(&stored, &outcome).await;
                Ok(())
            }
            Ok(None) => {
                DispatcherStats::incr(&self.inner.stats.discarded);
                DeliveryMetrics::record_discarded();
                tracing::info!(
                    outcome = outcome.metric_label(),
                    "Job moved during send, outcome discarded"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    outcome = outcome.metric_label(),
                    "Attempt outcome not recorded, job stays in flight until reconciled"
                );
                Err(e)
            }
        }
    }

    async fn after_attempt(&self, job: &DeliveryJob, outcome: &SendOutcome) {
        let stats = &self.inner.stats;
        match job.state {
            JobState::Succeeded => DispatcherStats::incr(&stats.succeeded),
            JobState::TransientFailed => {
                DispatcherStats::incr(&stats.transient_failures);
                DispatcherStats::incr(&stats.retries_scheduled);
                let due = job.next_attempt_at.unwrap_or_else(Utc::now);
                self.inner.scheduler.insert(job.id, due);
                tracing::debug!(
                    attempt = job.attempts,
                    next_attempt_at = %due,
                    "Transient failure, retry scheduled"
                );
            }
            JobState::PermanentFailed => {
                DispatcherStats::incr(&stats.permanent_failures);
                if let SendOutcome::TransientFailed(_) = outcome {
                    DispatcherStats::incr(&stats.transient_failures);
                }
                tracing::info!(
                    channel = %job.channel,
                    attempts = job.attempts,
                    error = job.last_error_detail.as_deref().unwrap_or(""),
                    "Job failed permanently"
                );
            }
            _ => {}
        }

        if job.state.is_terminal() {
            self.evict_if_settled(&job.notification_id).await;
        }
    }

    /// Apply a transition that closes a job without sending.
    async fn finish(&self, current: &DeliveryJob, next: DeliveryJob) -> StoreResult<()> {
        if let Some(stored) = self.inner.tracker.transition(current, next, None).await? {
            if stored.state == JobState::PermanentFailed {
                DispatcherStats::incr(&self.inner.stats.permanent_failures);
            }
            self.evict_if_settled(&stored.notification_id).await;
        }
        Ok(())
    }

    async fn evict_if_settled(&self, id: &NotificationId) {
        if let Ok(Some(status)) = self.inner.tracker.status(id).await {
            if status.is_terminal() {
                self.inner.render_cache.evict(id);
            }
        }
    }

    fn content_for(
        &self,
        record: &NotificationRecord,
        job: &DeliveryJob,
    ) -> Result<Arc<RenderedContent>, TemplateError> {
        if let Some(content) = self
            .inner
            .render_cache
            .get(&job.notification_id, job.channel, &job.locale)
        {
            return Ok(content);
        }

        let content = Arc::new(self.inner.templates.render(
            &record.request.template_id,
            job.channel,
            &job.locale,
            &record.request.payload,
        )?);
        self.inner
            .render_cache
            .insert(&job.notification_id, job.channel, &job.locale, content.clone());
        Ok(content)
    }

    /// Notifications with cached rendered content
    pub fn cached_renders(&self) -> usize {
        self.inner.render_cache.len()
    }
}
