//! Command error model.
//!
//! Expected failures travel as values (`CommandResult`), never as panics. The
//! dispatch runtime only needs one bit of information from an error: whether
//! redelivering the message could help.

use core::fmt;

use thiserror::Error;

use crate::id::JobId;

/// Result type returned by every command handler.
pub type CommandResult = Result<(), CommandError>;

/// Coarse error classification used for acknowledge/retry decisions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed command input. Redelivery cannot fix it.
    Validation,
    /// The job row does not exist yet (update arrived before the insert).
    NotYetAvailable,
    /// Store or transport unavailable.
    Infrastructure,
    /// A fault nobody anticipated (including panics caught at the dispatch boundary).
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotYetAvailable => "not_yet_available",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured command failure (kind + human-readable message).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CommandError {
    kind: ErrorKind,
    message: String,
}

impl CommandError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    /// Sentinel for out-of-order delivery: the job has not been inserted yet.
    pub fn job_not_yet_available(job_id: JobId) -> Self {
        Self::new(
            ErrorKind::NotYetAvailable,
            format!("job {job_id} not yet available for update"),
        )
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Infrastructure, msg)
    }

    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether leaving the message unacknowledged (and redelivering it) may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, ErrorKind::Validation)
    }

    pub fn is_not_yet_available(&self) -> bool {
        matches!(self.kind, ErrorKind::NotYetAvailable)
    }
}
