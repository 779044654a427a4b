//! Execution preconditions attached to a task.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};

/// A precondition that must hold before a task is eligible to run.
///
/// Serialized adjacently tagged (`{"kind": "not_before", "at": "..."}`).
/// Anything that does not decode as a known kind, with or without a
/// parameter, becomes [`Constraint::Unknown`] instead of failing the whole
/// record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum Constraint {
    NetworkConnected,
    Charging,
    DeviceIdle,
    NotBefore(DateTime<Utc>),
    NotAfter(DateTime<Utc>),
    Unknown,
}

#[derive(Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
enum KnownConstraint {
    NetworkConnected,
    Charging,
    DeviceIdle,
    NotBefore(DateTime<Utc>),
    NotAfter(DateTime<Utc>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConstraintRepr {
    Known(KnownConstraint),
    Other(IgnoredAny),
}

impl<'de> Deserialize<'de> for Constraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match ConstraintRepr::deserialize(deserializer)? {
            ConstraintRepr::Known(KnownConstraint::NetworkConnected) => Constraint::NetworkConnected,
            ConstraintRepr::Known(KnownConstraint::Charging) => Constraint::Charging,
            ConstraintRepr::Known(KnownConstraint::DeviceIdle) => Constraint::DeviceIdle,
            ConstraintRepr::Known(KnownConstraint::NotBefore(at)) => Constraint::NotBefore(at),
            ConstraintRepr::Known(KnownConstraint::NotAfter(at)) => Constraint::NotAfter(at),
            ConstraintRepr::Other(_) => Constraint::Unknown,
        })
    }
}

/// Constraint kind without its parameter (used by list filters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    NetworkConnected,
    Charging,
    DeviceIdle,
    NotBefore,
    NotAfter,
    Unknown,
}

impl Constraint {
    pub fn kind(&self) -> ConstraintKind {
        match self {
            Constraint::NetworkConnected => ConstraintKind::NetworkConnected,
            Constraint::Charging => ConstraintKind::Charging,
            Constraint::DeviceIdle => ConstraintKind::DeviceIdle,
            Constraint::NotBefore(_) => ConstraintKind::NotBefore,
            Constraint::NotAfter(_) => ConstraintKind::NotAfter,
            Constraint::Unknown => ConstraintKind::Unknown,
        }
    }
}

/// The immutable set of constraints of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Constraints(BTreeSet<Constraint>);

impl Constraints {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(mut self, constraint: Constraint) -> Self {
        self.0.insert(constraint);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.0.iter()
    }

    pub fn contains_kind(&self, kind: ConstraintKind) -> bool {
        self.0.iter().any(|c| c.kind() == kind)
    }

    /// Earliest `NotAfter` bound, if any.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.0
            .iter()
            .filter_map(|c| match c {
                Constraint::NotAfter(at) => Some(*at),
                _ => None,
            })
            .min()
    }
}

impl FromIterator<Constraint> for Constraints {
    fn from_iter<I: IntoIterator<Item = Constraint>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Constraints {
    type Item = &'a Constraint;
    type IntoIter = std::collections::btree_set::Iter<'a, Constraint>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
