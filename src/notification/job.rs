//! Delivery jobs and their append-only attempt records.
//!
//! A job is the unit of dispatch work: one recipient on one channel. All
//! state changes go through the pure transition helpers here and are then
//! persisted with a compare-and-swap on `version`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::BackoffPolicy;
use crate::transport::SendOutcome;

use super::{ChannelKind, NotificationId};

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    /// Holds a send slot; the send is running or its outcome is not stored yet
    InFlight,
    Succeeded,
    TransientFailed,
    PermanentFailed,
    /// Cancelled before completing
    Withdrawn,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::PermanentFailed | JobState::Withdrawn
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
            JobState::Succeeded => "succeeded",
            JobState::TransientFailed => "transient_failed",
            JobState::PermanentFailed => "permanent_failed",
            JobState::Withdrawn => "withdrawn",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of the last failure seen by a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    /// The last attempt failed transiently and no attempts remain
    RetriesExhausted,
    /// Content could not be rendered at dispatch time
    Render,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: JobId,
    pub notification_id: NotificationId,
    pub recipient_id: String,
    pub channel: ChannelKind,
    pub address: String,
    pub locale: String,
    pub state: JobState,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorKind>,
    pub last_error_detail: Option<String>,
    /// Bumped on every persisted change; guards compare-and-swap
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn new(
        notification_id: NotificationId,
        recipient_id: impl Into<String>,
        channel: ChannelKind,
        address: impl Into<String>,
        locale: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            notification_id,
            recipient_id: recipient_id.into(),
            channel,
            address: address.into(),
            locale: locale.into(),
            state: JobState::Pending,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            last_error_detail: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn next_version(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next.updated_at = now;
        next
    }

    /// Move into `InFlight`, consuming an attempt slot.
    ///
    /// A job recovered while already `InFlight` keeps its attempt count: the
    /// earlier attempt never recorded an outcome, so it is re-run in place.
    pub fn begin_attempt(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.next_version(now);
        if self.state != JobState::InFlight {
            next.attempts += 1;
        }
        next.state = JobState::InFlight;
        next.next_attempt_at = None;
        next
    }

    /// Apply a transport outcome to an `InFlight` job.
    ///
    /// Returns the next job version and the record to append with it.
    pub fn complete_attempt(
        &self,
        outcome: &SendOutcome,
        max_attempts: u32,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> (Self, DeliveryRecord) {
        let mut next = self.next_version(now);
        let record = DeliveryRecord::new(self, outcome, now);

        match outcome {
            SendOutcome::Succeeded => {
                next.state = JobState::Succeeded;
                next.next_attempt_at = None;
                next.last_error = None;
                next.last_error_detail = None;
            }
            SendOutcome::TransientFailed(reason) => {
                next.last_error_detail = Some(reason.clone());
                if self.attempts < max_attempts {
                    let delay = backoff.delay(self.attempts);
                    next.state = JobState::TransientFailed;
                    next.last_error = Some(ErrorKind::Transient);
                    next.next_attempt_at = Some(
                        now + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::milliseconds(backoff.max_delay_ms() as i64)),
                    );
                } else {
                    next.state = JobState::PermanentFailed;
                    next.last_error = Some(ErrorKind::RetriesExhausted);
                    next.next_attempt_at = None;
                }
            }
            SendOutcome::PermanentFailed(reason) => {
                next.state = JobState::PermanentFailed;
                next.last_error = Some(ErrorKind::Permanent);
                next.last_error_detail = Some(reason.clone());
                next.next_attempt_at = None;
            }
        }

        (next, record)
    }

    /// Fail without an attempt outcome (content could not be rendered).
    pub fn fail_render(&self, detail: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut next = self.next_version(now);
        next.state = JobState::PermanentFailed;
        next.last_error = Some(ErrorKind::Render);
        next.last_error_detail = Some(detail.into());
        next.next_attempt_at = None;
        next
    }

    /// Close out a job whose attempt budget is already spent.
    pub fn exhaust(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.next_version(now);
        next.state = JobState::PermanentFailed;
        next.last_error = Some(ErrorKind::RetriesExhausted);
        next.next_attempt_at = None;
        next
    }

    pub fn withdraw(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.next_version(now);
        next.state = JobState::Withdrawn;
        next.next_attempt_at = None;
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Succeeded,
    TransientFailed,
    PermanentFailed,
}

/// One attempt outcome. Records are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub job_id: JobId,
    pub notification_id: NotificationId,
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub result: AttemptResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DeliveryRecord {
    fn new(job: &DeliveryJob, outcome: &SendOutcome, at: DateTime<Utc>) -> Self {
        let (result, detail) = match outcome {
            SendOutcome::Succeeded => (AttemptResult::Succeeded, None),
            SendOutcome::TransientFailed(reason) => {
                (AttemptResult::TransientFailed, Some(reason.clone()))
            }
            SendOutcome::PermanentFailed(reason) => {
                (AttemptResult::PermanentFailed, Some(reason.clone()))
            }
        };
        Self {
            job_id: job.id,
            notification_id: job.notification_id.clone(),
            attempt: job.attempts,
            at,
            result,
            detail,
        }
    }
}
