//! Constraint evaluation against an environment snapshot.

use chrono::{DateTime, Utc};

use crate::domain::{Constraint, Constraints};
use crate::ports::EnvironmentSnapshot;

/// Pure readiness check: no I/O, no side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstraintEvaluator;

impl ConstraintEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Do all constraints hold for this snapshot?
    ///
    /// An empty set always holds. `Unknown` never holds (fail closed).
    pub fn evaluate(&self, constraints: &Constraints, env: &EnvironmentSnapshot) -> bool {
        constraints.iter().all(|c| Self::holds(c, env))
    }

    /// A `NotAfter` bound has passed, so the constraints can never hold again.
    pub fn window_closed(&self, constraints: &Constraints, now: DateTime<Utc>) -> bool {
        constraints.deadline().is_some_and(|deadline| now > deadline)
    }

    fn holds(constraint: &Constraint, env: &EnvironmentSnapshot) -> bool {
        match constraint {
            Constraint::NetworkConnected => env.network_connected,
            Constraint::Charging => env.charging,
            Constraint::DeviceIdle => env.device_idle,
            Constraint::NotBefore(at) => env.now >= *at,
            Constraint::NotAfter(at) => env.now <= *at,
            Constraint::Unknown => false,
        }
    }
}
