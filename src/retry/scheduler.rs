//! Time-ordered retry queue.
//!
//! The scheduler owns every pending retry. Its only mutators are
//! [`RetryScheduler::insert`], [`RetryScheduler::withdraw`] and
//! [`RetryScheduler::pop_due`], serialized by one mutex. The background loop
//! sleeps until the earliest entry is due (or until an insert wakes it) and
//! forwards due job ids to the dispatcher.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

use crate::metrics::RetryMetrics;
use crate::notification::JobId;

/// How long the loop sleeps when nothing is scheduled
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// Withdrawal markers older than this are forgotten
const WITHDRAWN_RETENTION_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledRetry {
    due: DateTime<Utc>,
    seq: u64,
    job_id: JobId,
}

impl Ord for ScheduledRetry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for ScheduledRetry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Reverse<ScheduledRetry>>,
    /// Latest live entry per job; older heap entries are stale
    live: HashMap<JobId, u64>,
    /// Jobs withdrawn, checked when their entry pops
    withdrawn: HashMap<JobId, DateTime<Utc>>,
    seq: u64,
}

impl SchedulerState {
    fn purge_stale_head(&mut self) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.live.get(&head.job_id) == Some(&head.seq) {
                break;
            }
            self.heap.pop();
        }
    }
}

pub struct RetryScheduler {
    state: Mutex<SchedulerState>,
    notify: Notify,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedule `job_id` to be re-presented at `due`. Re-inserting a job
    /// replaces its earlier entry.
    pub fn insert(&self, job_id: JobId, due: DateTime<Utc>) {
        let size = {
            let mut state = self.lock();
            state.seq += 1;
            let seq = state.seq;
            state.live.insert(job_id, seq);
            state.heap.push(Reverse(ScheduledRetry { due, seq, job_id }));
            state.live.len()
        };
        RetryMetrics::record_scheduled(size);
        self.notify.notify_one();
    }

    /// Withdraw a job. Takes effect when its entry would pop, including an
    /// entry inserted after this call.
    pub fn withdraw(&self, job_id: JobId) {
        let mut state = self.lock();
        state.withdrawn.insert(job_id, Utc::now());
    }

    /// Remove and return every live, non-withdrawn job due at or before `now`.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut due = Vec::new();
        let mut withdrawn_count = 0;
        let size = {
            let mut state = self.lock();
            while let Some(Reverse(head)) = state.heap.peek() {
                if head.due > now {
                    break;
                }
                let Some(Reverse(entry)) = state.heap.pop() else {
                    break;
                };
                if state.live.get(&entry.job_id) != Some(&entry.seq) {
                    continue;
                }
                state.live.remove(&entry.job_id);
                if state.withdrawn.remove(&entry.job_id).is_some() {
                    withdrawn_count += 1;
                    continue;
                }
                due.push(entry.job_id);
            }

            let cutoff = now - chrono::Duration::seconds(WITHDRAWN_RETENTION_SECS);
            state.withdrawn.retain(|_, at| *at > cutoff);
            state.purge_stale_head();
            state.live.len()
        };

        for _ in 0..withdrawn_count {
            RetryMetrics::record_withdrawn();
        }
        RetryMetrics::set_queue_size(size);
        due
    }

    /// Due time of the earliest live entry.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        let mut state = self.lock();
        state.purge_stale_head();
        state.heap.peek().map(|Reverse(entry)| entry.due)
    }

    /// Number of live scheduled jobs (withdrawn entries count until popped).
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_scheduled(&self, job_id: &JobId) -> bool {
        self.lock().live.contains_key(job_id)
    }

    /// Start the background loop forwarding due jobs to `tx`.
    ///
    /// The loop exits on shutdown or when the receiver is gone.
    pub fn start(
        self: &Arc<Self>,
        tx: mpsc::Sender<JobId>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Retry scheduler started");
            loop {
                let wait = match scheduler.next_due() {
                    Some(due) => (due - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                    None => IDLE_WAIT,
                };

                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = scheduler.notify.notified() => continue,
                    _ = tokio::time::sleep(wait) => {
                        for job_id in scheduler.pop_due(Utc::now()) {
                            if tx.send(job_id).await.is_err() {
                                tracing::warn!("Dispatcher queue closed, stopping retry scheduler");
                                return;
                            }
                        }
                    }
                }
            }
            tracing::info!(pending = scheduler.len(), "Retry scheduler stopped");
        })
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}
