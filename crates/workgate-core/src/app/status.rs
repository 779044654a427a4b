//! Status - 状態ごとの件数

use serde::{Deserialize, Serialize};

use crate::domain::TaskState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StateCounts {
    pub fn add(&mut self, state: TaskState, n: usize) {
        match state {
            TaskState::Pending => self.pending += n,
            TaskState::Ready => self.ready += n,
            TaskState::Running => self.running += n,
            TaskState::Succeeded => self.succeeded += n,
            TaskState::Failed => self.failed += n,
            TaskState::Cancelled => self.cancelled += n,
        }
    }

    pub fn get(&self, state: TaskState) -> usize {
        match state {
            TaskState::Pending => self.pending,
            TaskState::Ready => self.ready,
            TaskState::Running => self.running,
            TaskState::Succeeded => self.succeeded,
            TaskState::Failed => self.failed,
            TaskState::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> usize {
        TaskState::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Records that still have work ahead of them.
    pub fn live(&self) -> usize {
        self.pending + self.ready + self.running
    }
}

impl FromIterator<TaskState> for StateCounts {
    fn from_iter<I: IntoIterator<Item = TaskState>>(iter: I) -> Self {
        let mut counts = Self::default();
        for state in iter {
            counts.add(state, 1);
        }
        counts
    }
}
