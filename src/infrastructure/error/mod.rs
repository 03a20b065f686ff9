use thiserror::Error;

use crate::notification::{NotificationId, NotificationStatus};
use crate::recipient::DirectoryError;
use crate::template::TemplateError;
use crate::tracker::StoreError;

/// Errors surfaced synchronously by `Submit`.
///
/// Anything that goes wrong after a request is accepted is only visible
/// through the status query.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    /// The id was already accepted; nothing was re-dispatched.
    #[error("Duplicate request {notification_id} (status: {status})")]
    DuplicateRequest {
        notification_id: NotificationId,
        status: NotificationStatus,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SubmitError {
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::InvalidRequest(_) => "INVALID_REQUEST",
            SubmitError::InvalidTarget(_) => "INVALID_TARGET",
            SubmitError::InvalidTemplate(_) => "INVALID_TEMPLATE",
            SubmitError::DuplicateRequest { .. } => "DUPLICATE_REQUEST",
            SubmitError::Store(_) => "STORE_UNAVAILABLE",
        }
    }

    /// True when the request itself was at fault and retrying it unchanged is pointless.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SubmitError::InvalidRequest(_)
                | SubmitError::InvalidTarget(_)
                | SubmitError::InvalidTemplate(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "CONFIG_ERROR",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Store(_) => "STORE_UNAVAILABLE",
            EngineError::Template(_) => "TEMPLATE_ERROR",
            EngineError::Directory(_) => "DIRECTORY_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
