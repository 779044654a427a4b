//! Task state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// TaskState はタスクの状態を表現
///
/// State transitions:
/// - Pending -> Ready -> Running -> Succeeded
/// - Running -> Pending (retryable failure with budget left, or an interrupted run)
/// - Running -> Failed (non-retryable failure / budget exhausted)
/// - Ready -> Pending (constraints no longer hold)
/// - Pending | Ready | Running -> Cancelled
/// - Pending | Ready -> Failed (NotAfter window closed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for constraints or for `next_eligible_time`.
    Pending,

    /// Constraints hold; waiting for a worker slot.
    Ready,

    /// Currently executing.
    Running,

    Succeeded,

    /// Failed permanently (non-retryable, exhausted, or window expired).
    Failed,

    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::Ready,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Is this task a candidate for a dispatch cycle?
    pub fn is_dispatchable(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Ready)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Ready | Cancelled | Failed)
                | (Ready, Running | Pending | Cancelled | Failed)
                | (Running, Succeeded | Pending | Failed | Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task state '{0}'")]
pub struct UnknownState(pub String);

impl FromStr for TaskState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}
