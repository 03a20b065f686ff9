use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::metrics::DeliveryMetrics;
use crate::notification::JobState;
use crate::tracker::StoreResult;

use super::{Dispatcher, RecoveryReport};

impl Dispatcher {
    /// Reload every non-terminal job after a restart.
    ///
    /// Pending and InFlight jobs go back on the work queue; an InFlight job
    /// re-runs its attempt without consuming a new slot. TransientFailed
    /// jobs are re-inserted into the scheduler at their stored due time.
    /// The dispatch loop must already be running.
    pub async fn recover(&self) -> StoreResult<RecoveryReport> {
        let jobs = self.inner.tracker.active_jobs().await?;
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for job in jobs {
            match job.state {
                JobState::Pending | JobState::InFlight => {
                    if self.enqueue(job.id).await {
                        report.requeued += 1;
                    }
                }
                JobState::TransientFailed => {
                    self.inner
                        .scheduler
                        .insert(job.id, job.next_attempt_at.unwrap_or(now));
                    report.rescheduled += 1;
                }
                _ => {}
            }
        }

        DeliveryMetrics::record_recovered("startup", report.total());
        tracing::info!(
            requeued = report.requeued,
            rescheduled = report.rescheduled,
            "Recovered active jobs"
        );
        Ok(report)
    }

    /// Re-dispatch jobs that look abandoned.
    ///
    /// InFlight and Pending jobs untouched for `stale_after`, and overdue
    /// TransientFailed jobs the scheduler no longer holds, are picked up
    /// again. Jobs with an attempt running in this process are skipped.
    pub async fn reconcile(&self, stale_after: Duration) -> StoreResult<RecoveryReport> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
        let mut report = RecoveryReport::default();

        for job in self.inner.tracker.active_jobs().await? {
            if self.inner.in_progress.contains(&job.id) {
                continue;
            }
            match job.state {
                JobState::Pending | JobState::InFlight if job.updated_at <= cutoff => {
                    tracing::debug!(job_id = %job.id, state = %job.state, "Re-dispatching stale job");
                    if self.enqueue(job.id).await {
                        report.requeued += 1;
                    }
                }
                JobState::TransientFailed
                    if job.next_attempt_at.map_or(true, |at| at <= cutoff)
                        && !self.inner.scheduler.is_scheduled(&job.id) =>
                {
                    self.inner.scheduler.insert(job.id, now);
                    report.rescheduled += 1;
                }
                _ => {}
            }
        }

        if report.total() > 0 {
            DeliveryMetrics::record_recovered("reconcile", report.total());
            tracing::info!(
                requeued = report.requeued,
                rescheduled = report.rescheduled,
                "Reconciled stale jobs"
            );
        }
        Ok(report)
    }

    /// Run [`Dispatcher::reconcile`] every `interval` until shutdown.
    pub fn start_reconciler(
        &self,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let stale_after = dispatcher.inner.config.stale_in_flight;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // Skip immediate first tick
            timer.tick().await;

            tracing::info!(
                interval_secs = interval.as_secs(),
                stale_after_secs = stale_after.as_secs(),
                "Reconciler started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = timer.tick() => {
                        if let Err(e) = dispatcher.reconcile(stale_after).await {
                            tracing::warn!(error = %e, "Reconciliation pass failed");
                        }
                    }
                }
            }

            tracing::info!("Reconciler stopped");
        })
    }
}
