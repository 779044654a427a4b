//! Domain model (IDs, states, constraints, records, outcomes, decisions).
//!
//! ここにあるのは純粋な値と規則だけで、I/O や非同期処理は持たない。
//! 状態遷移の合法性は `TaskRecord::apply` に集約されている。

pub mod constraint;
pub mod decision;
pub mod errors;
pub mod filter;
pub mod ids;
pub mod outcome;
pub mod record;
pub mod state;

pub use constraint::{Constraint, ConstraintKind, Constraints};
pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{SchedulerError, StoreError, WorkError};
pub use filter::TaskFilter;
pub use ids::{IdParseError, TaskId};
pub use outcome::{FailureKind, Outcome};
pub use record::{TaskRecord, Transition};
pub use state::{TaskState, UnknownState};
