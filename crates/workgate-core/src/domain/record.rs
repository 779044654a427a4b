//! Task record: the persisted definition and run state of one task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::constraint::Constraints;
use super::errors::StoreError;
use super::ids::TaskId;
use super::state::TaskState;

/// Metadata + payload for a task.
///
/// Design:
/// - This is the "single source of truth" for task state.
/// - All state transitions go through [`TaskRecord::apply`], which every store
///   calls under its own per-record atomicity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub constraints: Constraints,
    pub state: TaskState,

    /// Completed attempts (success or failure reported by the runner).
    pub attempt_count: u32,

    /// Retry budget, always >= 1.
    pub max_attempts: u32,

    pub next_eligible_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub last_error: Option<String>,
    pub result: Option<Vec<u8>>,
}

/// A requested state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Pending -> Ready.
    MarkReady,

    /// Ready -> Pending (constraints stopped holding before dispatch).
    Unready,

    /// Ready -> Running.
    Dispatch,

    /// Running -> Succeeded.
    Succeed { result: Vec<u8> },

    /// Running -> Pending with a later eligibility.
    Retry {
        error: String,
        next_eligible_time: DateTime<Utc>,
    },

    /// Running -> Failed (non-retryable or out of attempts).
    Fail { error: String },

    /// Pending | Ready -> Failed (the `NotAfter` window closed). Not an attempt.
    Expire { error: String },

    /// Pending | Ready -> Cancelled, requested by a caller.
    Cancel { reason: Option<String> },

    /// Running -> Cancelled, the outcome of a run whose cancel was requested.
    CancelRun { reason: Option<String> },

    /// Running -> Pending after the process died mid-run. Not an attempt.
    Interrupted,
}

impl Transition {
    pub fn target(&self) -> TaskState {
        match self {
            Transition::MarkReady => TaskState::Ready,
            Transition::Unready | Transition::Retry { .. } | Transition::Interrupted => {
                TaskState::Pending
            }
            Transition::Dispatch => TaskState::Running,
            Transition::Succeed { .. } => TaskState::Succeeded,
            Transition::Fail { .. } | Transition::Expire { .. } => TaskState::Failed,
            Transition::Cancel { .. } | Transition::CancelRun { .. } => TaskState::Cancelled,
        }
    }

    /// States this transition may be applied from.
    pub fn sources(&self) -> &'static [TaskState] {
        use TaskState::*;
        match self {
            Transition::MarkReady => &[Pending],
            Transition::Unready | Transition::Dispatch => &[Ready],
            Transition::Succeed { .. }
            | Transition::Retry { .. }
            | Transition::Fail { .. }
            | Transition::CancelRun { .. }
            | Transition::Interrupted => &[Running],
            Transition::Expire { .. } | Transition::Cancel { .. } => &[Pending, Ready],
        }
    }
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        task_type: impl Into<String>,
        payload: Vec<u8>,
        constraints: Constraints,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type: task_type.into(),
            payload,
            constraints,
            state: TaskState::Pending,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            next_eligible_time: now,
            created_at: now,
            updated_at: now,
            last_error: None,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_time <= now
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// Apply a transition, checking legality against the current state.
    ///
    /// On error the record is left untouched.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<(), StoreError> {
        let to = transition.target();
        if !transition.sources().contains(&self.state) || !self.state.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            });
        }

        if matches!(transition, Transition::MarkReady | Transition::Dispatch)
            && !self.is_eligible_at(now)
        {
            return Err(StoreError::NotYetEligible {
                id: self.id,
                until: self.next_eligible_time,
            });
        }

        let now = now.max(self.updated_at);
        match transition {
            Transition::MarkReady | Transition::Unready | Transition::Dispatch => {}
            Transition::Succeed { result } => {
                self.attempt_count += 1;
                self.result = Some(result);
                self.last_error = None;
            }
            Transition::Retry {
                error,
                next_eligible_time,
            } => {
                self.attempt_count += 1;
                self.last_error = Some(error);
                self.next_eligible_time = next_eligible_time.max(now);
            }
            Transition::Fail { error } => {
                self.attempt_count += 1;
                self.last_error = Some(error);
            }
            Transition::Expire { error } => {
                self.last_error = Some(error);
            }
            Transition::Cancel { reason } | Transition::CancelRun { reason } => {
                if reason.is_some() {
                    self.last_error = reason;
                }
            }
            Transition::Interrupted => {
                self.next_eligible_time = now;
            }
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }
}
