//! Error types for the Jiva CSI driver
//!
//! Every failure in the driver is an [`Error`]. Each variant maps onto one
//! status [`Code`] of the container-storage RPC protocol, which is what the
//! orchestrator sees and uses to drive its own retry policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Protocol Status Codes
// =============================================================================

/// Status codes understood by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Ok,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    DeadlineExceeded,
    ResourceExhausted,
    Unavailable,
    Internal,
}

impl Code {
    /// Protocol name of the code, as carried on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::Unavailable => "UNAVAILABLE",
            Code::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Error
// =============================================================================

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Validation / Invariants
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Volume {volume_id}: shrinking from {current_bytes} to {requested_bytes} bytes is not supported")]
    ShrinkRejected {
        volume_id: String,
        current_bytes: u64,
        requested_bytes: u64,
    },

    // =========================================================================
    // Conflict / Lookup
    // =========================================================================
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Volume {name} already exists with different parameters: {reason}")]
    AlreadyExists { name: String, reason: String },

    #[error("Concurrent update of {kind}/{name} detected")]
    VersionConflict { kind: String, name: String },

    // =========================================================================
    // State Machine
    // =========================================================================
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Operation already in progress for {key}")]
    OperationInProgress { key: String },

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Operation on {volume_id} was cancelled")]
    Cancelled { volume_id: String },

    #[error("Timed out after {elapsed:?} waiting for {what}")]
    DeadlineExceeded { what: String, elapsed: Duration },

    // =========================================================================
    // Backend
    // =========================================================================
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend operation failed: {operation}: {reason}")]
    BackendOperationFailed { operation: String, reason: String },

    #[error("Backend refused to detach volume {volume_id}: {reason}")]
    DetachRefused { volume_id: String, reason: String },

    #[error("Insufficient backend capacity: {0}")]
    ResourceExhausted(String),

    #[error("Backend HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Kubernetes
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Host
    // =========================================================================
    #[error("iSCSI {operation} failed for {target}: {reason}")]
    Iscsi {
        operation: String,
        target: String,
        reason: String,
    },

    #[error("Mount failed at {path}: {reason}")]
    Mount { path: String, reason: String },

    #[error("Unmount failed at {path}: {reason}")]
    Unmount { path: String, reason: String },

    #[error("Formatting {device} as {fs_type} failed: {reason}")]
    Format {
        device: String,
        fs_type: String,
        reason: String,
    },

    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    // =========================================================================
    // Internal
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The call ran out of time or was cancelled before the work finished
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Cancelled { .. } | Error::DeadlineExceeded { .. })
    }

    /// Protocol status code reported to the orchestrator
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidArgument(_) | Error::ShrinkRejected { .. } => Code::InvalidArgument,
            Error::VolumeNotFound(_) => Code::NotFound,
            Error::AlreadyExists { .. } => Code::AlreadyExists,
            Error::FailedPrecondition(_) | Error::DetachRefused { .. } => {
                Code::FailedPrecondition
            }
            Error::VersionConflict { .. }
            | Error::Aborted(_)
            | Error::OperationInProgress { .. }
            | Error::Cancelled { .. } => Code::Aborted,
            Error::DeadlineExceeded { .. } => Code::DeadlineExceeded,
            Error::ResourceExhausted(_) => Code::ResourceExhausted,
            Error::BackendUnavailable(_) | Error::Http(_) => Code::Unavailable,
            Error::Kube(e) => kube_code(e),
            Error::BackendOperationFailed { .. }
            | Error::Iscsi { .. }
            | Error::Mount { .. }
            | Error::Unmount { .. }
            | Error::Format { .. }
            | Error::Command { .. }
            | Error::Configuration(_)
            | Error::Internal(_)
            | Error::Json(_)
            | Error::Io(_) => Code::Internal,
        }
    }

    /// Whether a component may retry the failed call locally before
    /// surfacing it
    pub fn is_transient(&self) -> bool {
        match self {
            Error::BackendUnavailable(_) | Error::Http(_) | Error::VersionConflict { .. } => true,
            Error::Kube(e) => matches!(kube_code(e), Code::Unavailable | Code::Aborted),
            _ => false,
        }
    }

    /// Whether the orchestrator can expect a later retry to succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            Code::Aborted | Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted
        )
    }

    /// Shorthand for a failed external command
    pub fn command(command: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Command {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a failed backend operation
    pub fn backend(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::BackendOperationFailed {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

/// Map a Kubernetes API failure onto a protocol code
fn kube_code(err: &kube::Error) -> Code {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => Code::NotFound,
            // 410: a list continue token expired
            409 | 410 => Code::Aborted,
            422 | 400 => Code::InvalidArgument,
            429 | 500..=599 => Code::Unavailable,
            _ => Code::Internal,
        },
        kube::Error::HyperError(_) | kube::Error::Service(_) => Code::Unavailable,
        _ => Code::Internal,
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::ShrinkRejected {
            volume_id: "v1".into(),
            current_bytes: 20,
            requested_bytes: 10,
        };
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(!err.is_retryable());

        let err = Error::OperationInProgress { key: "v1".into() };
        assert_eq!(err.code(), Code::Aborted);
        assert!(err.is_retryable());

        let err = Error::DetachRefused {
            volume_id: "v1".into(),
            reason: "attached".into(),
        };
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[test]
    fn test_kube_conflict_is_transient() {
        let err = Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        }));
        assert_eq!(err.code(), Code::Aborted);
        assert!(err.is_transient());

        let err = Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "not found".into(),
            reason: "NotFound".into(),
            code: 404,
        }));
        assert_eq!(err.code(), Code::NotFound);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_code_wire_names() {
        assert_eq!(Code::FailedPrecondition.to_string(), "FAILED_PRECONDITION");
        assert_eq!(
            serde_json::to_string(&Code::DeadlineExceeded).unwrap(),
            "\"DEADLINE_EXCEEDED\""
        );
    }
}
