//! EnvironmentProvider port - デバイス / 実行環境の状態
//!
//! スケジューラは dispatch cycle ごとに一度だけ snapshot を取り、
//! そのサイクル内の評価はすべて同じ snapshot に対して行う。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ある瞬間の環境の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub now: DateTime<Utc>,
    pub network_connected: bool,
    pub charging: bool,
    pub device_idle: bool,
}

impl EnvironmentSnapshot {
    /// Everything available: connected, charging, idle.
    pub fn unconstrained(now: DateTime<Utc>) -> Self {
        Self {
            now,
            network_connected: true,
            charging: true,
            device_idle: true,
        }
    }
}

/// Supplies the current environment. Implemented outside the engine
/// (platform bindings); [`ManualEnvironment`](crate::impls::ManualEnvironment)
/// is a settable implementation for tests and the CLI.
pub trait EnvironmentProvider: Send + Sync {
    fn snapshot(&self) -> EnvironmentSnapshot;
}
