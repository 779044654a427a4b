//! Record filter used by `TaskStore::list`.

use chrono::{DateTime, Utc};

use super::constraint::ConstraintKind;
use super::record::TaskRecord;
use super::state::TaskState;

/// All fields are optional; an empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub states: Option<Vec<TaskState>>,

    /// Only records with `next_eligible_time <= eligible_by`.
    pub eligible_by: Option<DateTime<Utc>>,

    pub task_type: Option<String>,

    /// Only records whose constraint set contains this kind.
    pub requires: Option<ConstraintKind>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_states(states: impl IntoIterator<Item = TaskState>) -> Self {
        Self {
            states: Some(states.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Pending/Ready records whose eligibility time has passed.
    pub fn dispatchable(now: DateTime<Utc>) -> Self {
        Self::in_states([TaskState::Pending, TaskState::Ready]).eligible_by(now)
    }

    pub fn eligible_by(mut self, at: DateTime<Utc>) -> Self {
        self.eligible_by = Some(at);
        self
    }

    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn requires(mut self, kind: ConstraintKind) -> Self {
        self.requires = Some(kind);
        self
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        if let Some(states) = &self.states
            && !states.contains(&record.state)
        {
            return false;
        }
        if let Some(at) = self.eligible_by
            && record.next_eligible_time > at
        {
            return false;
        }
        if let Some(task_type) = &self.task_type
            && &record.task_type != task_type
        {
            return false;
        }
        if let Some(kind) = self.requires
            && !record.constraints.contains_kind(kind)
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Constraint, Constraints, TaskId};
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn record(state: TaskState) -> TaskRecord {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let mut r = TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            "report.build.v1",
            vec![],
            Constraints::none().with(Constraint::Charging),
            3,
            now,
        );
        r.state = state;
        r
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(TaskFilter::all().matches(&record(TaskState::Succeeded)));
    }

    #[test]
    fn dispatchable_excludes_future_and_running() {
        let r = record(TaskState::Pending);
        let now = r.next_eligible_time;
        assert!(TaskFilter::dispatchable(now).matches(&r));
        assert!(!TaskFilter::dispatchable(now - Duration::seconds(1)).matches(&r));
        assert!(!TaskFilter::dispatchable(now).matches(&record(TaskState::Running)));
    }

    #[test]
    fn type_and_constraint_filters() {
        let r = record(TaskState::Pending);
        assert!(TaskFilter::all().task_type("report.build.v1").matches(&r));
        assert!(!TaskFilter::all().task_type("other").matches(&r));
        assert!(TaskFilter::all().requires(ConstraintKind::Charging).matches(&r));
        assert!(!TaskFilter::all()
            .requires(ConstraintKind::NetworkConnected)
            .matches(&r));
    }
}
