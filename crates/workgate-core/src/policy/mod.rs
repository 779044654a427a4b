//! Policies: pure decision helpers used by the scheduler.

pub mod backoff;
pub mod evaluator;

pub use self::backoff::BackoffPolicy;
pub use self::evaluator::ConstraintEvaluator;
