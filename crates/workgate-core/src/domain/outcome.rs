//! Outcome model: result of one call to the execution runner.
//!
//! Outcomes are plain values handed back to the scheduler; nothing here knows
//! about stores or workers.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::WorkError;

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureKind {
    /// The attempt exceeded the timeout of its task type.
    Timeout,

    /// No work function is registered for the task type.
    UnregisteredWork,

    /// The work function panicked.
    Panicked,

    /// The work function ignored a cancellation signal past the grace period.
    GraceExceeded,

    /// Caller-defined error kind reported by the work function.
    Work(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => f.write_str("timeout"),
            FailureKind::UnregisteredWork => f.write_str("unregistered_work"),
            FailureKind::Panicked => f.write_str("panicked"),
            FailureKind::GraceExceeded => f.write_str("grace_exceeded"),
            FailureKind::Work(kind) => f.write_str(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success {
        result: Vec<u8>,
    },
    Failure {
        kind: FailureKind,
        message: String,
        retryable: bool,
    },
    Cancelled,
}

impl Outcome {
    pub fn success(result: Vec<u8>) -> Self {
        Outcome::Success { result }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>, retryable: bool) -> Self {
        Outcome::Failure {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Outcome::Failure { retryable: true, .. })
    }

    /// `kind: message` for failures, used as `last_error`.
    pub fn describe(&self) -> Option<String> {
        match self {
            Outcome::Failure { kind, message, .. } => Some(format!("{kind}: {message}")),
            _ => None,
        }
    }
}

impl From<WorkError> for Outcome {
    fn from(err: WorkError) -> Self {
        let retryable = err.is_retryable();
        Outcome::Failure {
            kind: FailureKind::Work(err.kind().to_string()),
            message: err.message().to_string(),
            retryable,
        }
    }
}
