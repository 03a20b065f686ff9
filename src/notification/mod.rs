//! Notification domain model: requests, delivery jobs, attempt records and
//! the derived aggregate status.

mod job;
mod status;
mod types;

pub use job::{AttemptResult, DeliveryJob, DeliveryRecord, ErrorKind, JobId, JobState};
pub use status::{IntakeFailure, NotificationRecord, NotificationReport, NotificationStatus};
pub use types::{
    ChannelKind, DeliveryMode, NotificationId, NotificationRequest, NotificationRequestBuilder,
    NotificationTarget, MAX_NOTIFICATION_ID_LEN,
};
