//! Helper-side error type

use std::io;

use dh_protocol::{FailureReason, HelperResponse};
use thiserror::Error;

/// Why the helper refused or failed a request
#[derive(Error, Debug)]
pub enum RequestError {
    /// Path is relative, traverses upwards or sits outside the allowed roots
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Daemon label or argument failed validation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The peer may not ask for this
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Target file or daemon does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A system command exited unsuccessfully
    #[error("{command} failed: {detail}")]
    CommandFailed { command: String, detail: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RequestError {
    /// Wire-level reason for this error
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::InvalidPath(_) => FailureReason::InvalidPath,
            Self::InvalidArgument(_) => FailureReason::MalformedRequest,
            Self::PermissionDenied(_) => FailureReason::PermissionDenied,
            Self::NotFound(_) => FailureReason::NotFound,
            Self::CommandFailed { .. } => FailureReason::CommandFailed,
            Self::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                FailureReason::PermissionDenied
            }
            Self::Io(e) if e.kind() == io::ErrorKind::NotFound => FailureReason::NotFound,
            Self::Io(_) => FailureReason::Internal,
        }
    }

    /// The failure response carrying this error
    pub fn into_response(self) -> HelperResponse {
        HelperResponse::failure(self.reason(), self.to_string())
    }
}
