//! Error taxonomy for the processing pipeline.
//!
//! Messages never contain workspace paths. Filesystem context is carried in
//! fields so it can be logged without being rendered to callers.

use std::io;
use std::path::PathBuf;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, ProcessError>;

/// Every terminal failure a request can end in.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The submission itself is malformed (no files, no command, broken form).
    #[error("{message}")]
    InvalidRequest { message: String },

    /// An uploaded file exceeded the configured ceiling.
    #[error("file '{file_name}' exceeds maximum size of {limit_mb} MB")]
    PayloadTooLarge { file_name: String, limit_mb: u64 },

    /// JSON mode was requested but the payload is not an array of strings.
    #[error("command is not a JSON array of strings: {reason}")]
    InvalidCommandFormat { reason: String },

    /// A `{name}` token has no value for this request.
    #[error("unknown placeholder {{{token}}}")]
    UnknownPlaceholder { token: String },

    /// The template never mentions `{output}`.
    #[error("command must reference {{output}}")]
    MissingOutputToken,

    /// A denylisted character, sequence or argument was found.
    #[error("command contains blocked pattern {pattern:?}")]
    UnsafeCommand { pattern: String },

    /// The external tool could not be started at all.
    #[error("failed to launch {program}")]
    LaunchError {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The wall-clock limit expired and the process group was killed.
    #[error("command timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// The tool exited non-zero, was killed, or produced no output.
    #[error("{message}")]
    ProcessingFailed {
        message: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
    },

    /// Workspace creation or file I/O failed.
    #[error("storage failure during {operation}")]
    Storage {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ProcessError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn storage(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Stable name of the failure kind, as reported in error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "InvalidRequest",
            Self::PayloadTooLarge { .. } => "PayloadTooLarge",
            Self::InvalidCommandFormat { .. } => "InvalidCommandFormat",
            Self::UnknownPlaceholder { .. } => "UnknownPlaceholder",
            Self::MissingOutputToken => "MissingOutputToken",
            Self::UnsafeCommand { .. } => "UnsafeCommand",
            Self::LaunchError { .. } => "LaunchError",
            Self::Timeout { .. } => "Timeout",
            Self::ProcessingFailed { .. } => "ProcessingFailed",
            Self::Storage { .. } => "StorageError",
        }
    }

    /// Client-caused failures are 4xx, execution and environment failures 5xx.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. }
            | Self::InvalidCommandFormat { .. }
            | Self::UnknownPlaceholder { .. }
            | Self::MissingOutputToken
            | Self::UnsafeCommand { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::LaunchError { .. } | Self::ProcessingFailed { .. } | Self::Storage { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}
