use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DeliveryJob, JobState, NotificationId, NotificationRequest};

/// Aggregate status of a notification, derived from its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    PartiallyDelivered,
    Delivered,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    /// Derive the aggregate from job states.
    ///
    /// With no jobs the notification is `Failed` when intake recorded a
    /// failure and `Pending` otherwise.
    pub fn derive<I>(states: I, intake_failed: bool) -> Self
    where
        I: IntoIterator<Item = JobState>,
    {
        let (mut total, mut succeeded, mut withdrawn, mut open) = (0usize, 0usize, 0usize, 0usize);
        for state in states {
            total += 1;
            match state {
                JobState::Succeeded => succeeded += 1,
                JobState::Withdrawn => withdrawn += 1,
                JobState::PermanentFailed => {}
                JobState::Pending | JobState::InFlight | JobState::TransientFailed => open += 1,
            }
        }

        if total == 0 {
            return if intake_failed {
                NotificationStatus::Failed
            } else {
                NotificationStatus::Pending
            };
        }

        if open > 0 {
            NotificationStatus::Pending
        } else if succeeded == total {
            NotificationStatus::Delivered
        } else if succeeded > 0 {
            NotificationStatus::PartiallyDelivered
        } else if withdrawn > 0 {
            NotificationStatus::Cancelled
        } else {
            NotificationStatus::Failed
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, NotificationStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::PartiallyDelivered => "partially_delivered",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an accepted notification ended with no jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum IntakeFailure {
    NoEligibleRecipients,
    Render(String),
}

impl fmt::Display for IntakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntakeFailure::NoEligibleRecipients => f.write_str("no eligible recipients"),
            IntakeFailure::Render(detail) => write!(f, "render failed: {}", detail),
        }
    }
}

/// Stored notification document. The status is never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub request: NotificationRequest,
    pub accepted_at: DateTime<Utc>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intake_failure: Option<IntakeFailure>,
}

impl NotificationRecord {
    pub fn accepted(request: NotificationRequest) -> Self {
        Self {
            request,
            accepted_at: Utc::now(),
            cancelled: false,
            intake_failure: None,
        }
    }

    pub fn failed_at_intake(request: NotificationRequest, failure: IntakeFailure) -> Self {
        Self {
            intake_failure: Some(failure),
            ..Self::accepted(request)
        }
    }

    pub fn id(&self) -> &NotificationId {
        &self.request.id
    }

    pub fn status_of(&self, jobs: &[DeliveryJob]) -> NotificationStatus {
        NotificationStatus::derive(jobs.iter().map(|j| j.state), self.intake_failure.is_some())
    }
}

/// Status plus per-job detail for one notification.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationReport {
    pub notification_id: NotificationId,
    pub status: NotificationStatus,
    pub cancelled: bool,
    pub accepted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intake_failure: Option<IntakeFailure>,
    pub jobs: Vec<DeliveryJob>,
}

impl NotificationReport {
    pub fn new(record: NotificationRecord, jobs: Vec<DeliveryJob>) -> Self {
        Self {
            status: record.status_of(&jobs),
            notification_id: record.request.id,
            cancelled: record.cancelled,
            accepted_at: record.accepted_at,
            intake_failure: record.intake_failure,
            jobs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobState::*;

    #[test]
    fn test_no_jobs() {
        assert_eq!(NotificationStatus::derive(Vec::<JobState>::new(), false), NotificationStatus::Pending);
        assert_eq!(NotificationStatus::derive(Vec::<JobState>::new(), true), NotificationStatus::Failed);
    }

    #[test]
    fn test_any_open_job_is_pending() {
        for open in [Pending, InFlight, TransientFailed] {
            assert_eq!(
                NotificationStatus::derive([Succeeded, open], false),
                NotificationStatus::Pending
            );
        }
    }

    #[test]
    fn test_terminal_combinations() {
        assert_eq!(
            NotificationStatus::derive([Succeeded, Succeeded], false),
            NotificationStatus::Delivered
        );
        assert_eq!(
            NotificationStatus::derive([PermanentFailed, PermanentFailed], false),
            NotificationStatus::Failed
        );
        assert_eq!(
            NotificationStatus::derive([Succeeded, PermanentFailed], false),
            NotificationStatus::PartiallyDelivered
        );
        assert_eq!(
            NotificationStatus::derive([Succeeded, Withdrawn], false),
            NotificationStatus::PartiallyDelivered
        );
        assert_eq!(
            NotificationStatus::derive([Withdrawn, PermanentFailed], false),
            NotificationStatus::Cancelled
        );
    }

    #[test]
    fn test_terminal_flag() {
        assert!(!NotificationStatus::Pending.is_terminal());
        assert!(NotificationStatus::PartiallyDelivered.is_terminal());
        assert!(NotificationStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_intake_failure_serde() {
        let json = serde_json::to_value(IntakeFailure::Render("missing field name".into())).unwrap();
        assert_eq!(json["kind"], "render");
        assert_eq!(json["detail"], "missing field name");

        let json = serde_json::to_value(IntakeFailure::NoEligibleRecipients).unwrap();
        assert_eq!(json["kind"], "no_eligible_recipients");
    }
}
