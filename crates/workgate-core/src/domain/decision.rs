//! Decision model: what happens to a task after a run.
//!
//! The Decider is pure: given the record (before the outcome is applied) and
//! the outcome, it returns the next action. The scheduler turns the decision
//! into a [`Transition`](super::Transition) and persists it.

use std::time::Duration;

use super::outcome::Outcome;
use super::record::TaskRecord;
use crate::policy::BackoffPolicy;

/// The next action to take for a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Mark the task as succeeded and keep its result.
    Succeed { result: Vec<u8> },

    /// Retry the task after a delay.
    Retry { delay: Duration, reason: String },

    /// Give up: terminal Failed.
    Fail { reason: String },

    /// Terminal Cancelled.
    Cancel,
}

/// Trait for deciding the next action based on task state and outcome.
pub trait Decider: Send + Sync {
    /// `task` is the record as it was while Running (its `attempt_count` does
    /// not include the attempt that produced `outcome`).
    ///
    /// `cancel_requested` is true when `cancel(id)` was called for this run.
    fn decide(&self, task: &TaskRecord, outcome: &Outcome, cancel_requested: bool) -> Decision;
}

/// Attempt-based retry logic with exponential backoff:
/// - retryable failure with attempts remaining: Retry after `next_delay`
/// - non-retryable failure or budget exhausted: Fail
/// - cancellation requested: Cancel, whatever the runner managed to report
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    backoff: BackoffPolicy,
}

impl DefaultDecider {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, outcome: &Outcome, cancel_requested: bool) -> Decision {
        let attempt = task.attempt_count.saturating_add(1);
        match outcome {
            Outcome::Success { result } => Decision::Succeed {
                result: result.clone(),
            },
            Outcome::Cancelled => Decision::Cancel,
            // GraceExceeded などでも cancel 要求があれば Cancelled に寄せる
            Outcome::Failure { .. } if cancel_requested => Decision::Cancel,
            Outcome::Failure { retryable, .. } => {
                let described = outcome.describe().unwrap_or_default();
                if !retryable {
                    Decision::Fail {
                        reason: described,
                    }
                } else if attempt >= task.max_attempts {
                    Decision::Fail {
                        reason: format!(
                            "max attempts reached ({}/{}): {}",
                            attempt, task.max_attempts, described
                        ),
                    }
                } else {
                    let delay = self.backoff.next_delay(attempt);
                    Decision::Retry {
                        delay,
                        reason: described,
                    }
                }
            }
        }
    }
}
