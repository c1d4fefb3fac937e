// Service Errors
// Error taxonomy shared by all job scheduling operations

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable reason codes attached to invalid-argument errors so
/// clients can render a precise message without parsing error text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvalidReason {
    /// The template does not allow preflight jobs
    PreflightNotAllowed,
    /// The referenced changelist does not exist
    UnknownChange,
    /// The shelved changelist contains no files
    EmptyShelf,
    /// The shelved changelist belongs to a different stream
    WrongStream,
    /// A target argument does not name any node or aggregate
    UnknownTarget,
    /// An identifier could not be parsed
    MalformedId,
    /// The requested state change is not a legal transition
    IllegalTransition,
    /// A batch cannot complete while steps are still active
    StepsStillActive,
    /// The batch already has a bound lease/session
    LeaseAlreadyBound,
    /// The graph definition is structurally invalid
    InvalidGraph,
    /// A template document could not be parsed
    InvalidTemplate,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::PreflightNotAllowed => "preflight-not-allowed",
            InvalidReason::UnknownChange => "unknown-change",
            InvalidReason::EmptyShelf => "empty-shelf",
            InvalidReason::WrongStream => "wrong-stream",
            InvalidReason::UnknownTarget => "unknown-target",
            InvalidReason::MalformedId => "malformed-id",
            InvalidReason::IllegalTransition => "illegal-transition",
            InvalidReason::StepsStillActive => "steps-still-active",
            InvalidReason::LeaseAlreadyBound => "lease-already-bound",
            InvalidReason::InvalidGraph => "invalid-graph",
            InvalidReason::InvalidTemplate => "invalid-template",
        }
    }
}

/// Errors returned by job scheduling operations.
///
/// Optimistic-concurrency conflicts are never surfaced through this type;
/// they are retried inside the service and only show up as `Internal` when
/// the retry limit is exhausted.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid argument ({}): {message}", .reason.as_str())]
    InvalidArgument {
        reason: InvalidReason,
        message: String,
    },

    #[error("node '{0}' does not allow another attempt")]
    RetryNotAllowed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ServiceError::NotFound(what.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ServiceError::Forbidden(message.into())
    }

    pub fn invalid(reason: InvalidReason, message: impl Into<String>) -> Self {
        ServiceError::InvalidArgument {
            reason,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ServiceError::Internal(message.into())
    }

    /// Reason code for invalid-argument errors, if any
    pub fn reason(&self) -> Option<InvalidReason> {
        match self {
            ServiceError::InvalidArgument { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
