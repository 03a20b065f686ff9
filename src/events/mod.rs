//! State-transition events.
//!
//! Events are published into a bounded queue and fanned out to sinks by a
//! background consumer. Publishing never fails the caller: with the
//! `drop_newest` policy a full queue drops the event (and counts it), with
//! `block` the publisher waits for capacity.

mod bus;
mod sinks;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::notification::{JobId, JobState, NotificationId, NotificationStatus};

pub use bus::EventBus;
pub use sinks::{BroadcastSink, EventSink, TracingSink};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryEvent {
    JobTransition {
        notification_id: NotificationId,
        job_id: JobId,
        /// `None` when the job was just created
        from: Option<JobState>,
        to: JobState,
        at: DateTime<Utc>,
    },
    NotificationStatusChanged {
        notification_id: NotificationId,
        from: Option<NotificationStatus>,
        to: NotificationStatus,
        at: DateTime<Utc>,
    },
}

impl DeliveryEvent {
    pub fn job_transition(
        notification_id: &NotificationId,
        job_id: JobId,
        from: Option<JobState>,
        to: JobState,
    ) -> Self {
        DeliveryEvent::JobTransition {
            notification_id: notification_id.clone(),
            job_id,
            from,
            to,
            at: Utc::now(),
        }
    }

    pub fn status_changed(
        notification_id: &NotificationId,
        from: Option<NotificationStatus>,
        to: NotificationStatus,
    ) -> Self {
        DeliveryEvent::NotificationStatusChanged {
            notification_id: notification_id.clone(),
            from,
            to,
            at: Utc::now(),
        }
    }

    pub fn notification_id(&self) -> &NotificationId {
        match self {
            DeliveryEvent::JobTransition { notification_id, .. } => notification_id,
            DeliveryEvent::NotificationStatusChanged { notification_id, .. } => notification_id,
        }
    }
}
