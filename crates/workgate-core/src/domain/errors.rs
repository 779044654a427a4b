//! Errors - エラー型と分類
//!
//! - `StoreError`: TaskStore 操作のエラー（呼び出し元へ同期的に返す）
//! - `SchedulerError`: 公開 API（enqueue / cancel / status など）のエラー
//! - `WorkError`: work function が返すエラー（retryable / permanent を明示する）
//!
//! 実行時のエラー（timeout, 未登録, panic）は `Outcome::Failure` に畳み込まれ、
//! dispatch loop の外へは伝播しません。

use chrono::{DateTime, Utc};

use super::ids::TaskId;
use super::state::TaskState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} already exists")]
    DuplicateId(TaskId),

    #[error("task {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    /// Ready/dispatch requested before `next_eligible_time` (stale read).
    #[error("task {id} is not eligible until {until}")]
    NotYetEligible { id: TaskId, until: DateTime<Utc> },

    #[error("task {id} is {state}; only terminal records can be deleted")]
    InvalidState { id: TaskId, state: TaskState },

    /// A persisted row could not be decoded back into a record.
    #[error("record {id} is corrupted: {reason}")]
    Corrupted { id: String, reason: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("payload too large: {size} bytes (limit: {limit})")]
    InvalidPayload { size: usize, limit: usize },

    #[error("failed to encode typed payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Error reported by a work function.
///
/// The work function decides whether a retry makes sense; the scheduler only
/// reads `retryable`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WorkError {
    kind: String,
    message: String,
    retryable: bool,
}

impl WorkError {
    /// Transient failure (I/O hiccup, remote unavailable, ...).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: "transient".to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Failure that will not go away by retrying (malformed payload, ...).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: "permanent".to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    /// The work noticed the cancellation signal and stopped early.
    pub fn cancelled() -> Self {
        Self {
            kind: "cancelled".to_string(),
            message: "cancellation requested".to_string(),
            retryable: true,
        }
    }

    /// Wrap an arbitrary error; unknown errors lean towards retry.
    pub fn from_error(err: impl std::error::Error) -> Self {
        Self::retryable(err.to_string())
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}
