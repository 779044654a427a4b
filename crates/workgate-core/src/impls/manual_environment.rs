//! Settable environment provider.

use std::sync::{Arc, RwLock};

use crate::ports::{Clock, EnvironmentProvider, EnvironmentSnapshot};

#[derive(Debug, Clone, Copy)]
struct Flags {
    network_connected: bool,
    charging: bool,
    device_idle: bool,
}

/// Environment whose flags are set by hand; `now` comes from the clock.
///
/// Starts fully available (connected, charging, idle).
pub struct ManualEnvironment {
    flags: RwLock<Flags>,
    clock: Arc<dyn Clock>,
}

impl ManualEnvironment {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            flags: RwLock::new(Flags {
                network_connected: true,
                charging: true,
                device_idle: true,
            }),
            clock,
        }
    }

    pub fn set_network_connected(&self, connected: bool) {
        self.flags_mut(|f| f.network_connected = connected);
    }

    pub fn set_charging(&self, charging: bool) {
        self.flags_mut(|f| f.charging = charging);
    }

    pub fn set_device_idle(&self, idle: bool) {
        self.flags_mut(|f| f.device_idle = idle);
    }

    fn flags_mut(&self, f: impl FnOnce(&mut Flags)) {
        let mut flags = self.flags.write().unwrap_or_else(|e| e.into_inner());
        f(&mut flags);
    }
}

impl EnvironmentProvider for ManualEnvironment {
    fn snapshot(&self) -> EnvironmentSnapshot {
        let flags = *self.flags.read().unwrap_or_else(|e| e.into_inner());
        EnvironmentSnapshot {
            now: self.clock.now(),
            network_connected: flags.network_connected,
            charging: flags.charging,
            device_idle: flags.device_idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    #[test]
    fn snapshot_reflects_setters_and_clock() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let env = ManualEnvironment::new(clock.clone());

        assert_eq!(env.snapshot(), EnvironmentSnapshot::unconstrained(t0));

        env.set_network_connected(false);
        env.set_device_idle(false);
        clock.advance(std::time::Duration::from_secs(1));

        let snap = env.snapshot();
        assert!(!snap.network_connected);
        assert!(snap.charging);
        assert!(!snap.device_idle);
        assert_eq!(snap.now, t0 + chrono::TimeDelta::seconds(1));
    }
}
