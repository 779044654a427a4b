//! Configuration for the scheduler.
//!
//! Durations are integer milliseconds in the file and `Duration` in code.
//! Every table and field is optional; missing values take the defaults below.
//!
//! ```toml
//! max_concurrency = 4
//! tick_interval_ms = 1000
//!
//! [backoff]
//! base_delay_ms = 2000
//! multiplier = 2.0
//!
//! [runner.task_timeouts_ms]
//! "media.photo.upload.v1" = 120000
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Size of the worker pool.
    pub max_concurrency: usize,
    /// Interval of the periodic dispatch cycle.
    pub tick_interval_ms: u64,
    /// Upper bound for enqueued payloads.
    pub max_payload_bytes: usize,
    /// Retry budget for requests that do not set one.
    pub default_max_attempts: u32,
    pub backoff: BackoffConfig,
    pub runner: RunnerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            tick_interval_ms: 1_000,
            max_payload_bytes: 64 * 1024,
            default_max_attempts: 5,
            backoff: BackoffConfig::default(),
            runner: RunnerConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency", "must be at least 1"));
        }
        if self.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(invalid(
                "max_concurrency",
                format!("must be at most {}", Semaphore::MAX_PERMITS),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms", "must be positive"));
        }
        if self.default_max_attempts == 0 {
            return Err(invalid("default_max_attempts", "must be at least 1"));
        }
        self.backoff.validate()?;
        self.runner.validate()
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Relative jitter in `[0, 1)`; 0.2 means ±20%.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 15 * 60 * 1_000,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid(
                "backoff.multiplier",
                format!("must be >= 1.0, got {}", self.multiplier),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(invalid(
                "backoff.jitter",
                format!("must be in [0, 1), got {}", self.jitter),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(invalid(
                "backoff.base_delay_ms",
                format!(
                    "{} exceeds max_delay_ms {}",
                    self.base_delay_ms, self.max_delay_ms
                ),
            ));
        }
        Ok(())
    }
}

/// Execution runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// How long a cancelled or timed-out work function may take to yield.
    pub cancellation_grace_period_ms: u64,
    /// Timeout for task types without an entry in `task_timeouts_ms`.
    pub default_timeout_ms: u64,
    /// Per task type timeouts.
    pub task_timeouts_ms: HashMap<String, u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cancellation_grace_period_ms: 5_000,
            default_timeout_ms: 10 * 60 * 1_000,
            task_timeouts_ms: HashMap::new(),
        }
    }
}

impl RunnerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_period_ms)
    }

    pub fn timeout_for(&self, task_type: &str) -> Duration {
        let ms = self
            .task_timeouts_ms
            .get(task_type)
            .copied()
            .unwrap_or(self.default_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn with_timeout(mut self, task_type: impl Into<String>, timeout: Duration) -> Self {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.task_timeouts_ms.insert(task_type.into(), ms);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout_ms == 0 {
            return Err(invalid("runner.default_timeout_ms", "must be positive"));
        }
        if let Some((task_type, _)) = self.task_timeouts_ms.iter().find(|(_, ms)| **ms == 0) {
            return Err(invalid(
                "runner.task_timeouts_ms",
                format!("timeout for '{task_type}' must be positive"),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_file_gives_defaults() {
        let config = SchedulerConfig::from_toml_str("").unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.backoff.base_delay(), Duration::from_secs(2));
        assert_eq!(config.runner.grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn partial_file_overrides_only_what_it_names() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            max_concurrency = 2

            [backoff]
            base_delay_ms = 500

            [runner.task_timeouts_ms]
            "media.photo.upload.v1" = 120000
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.backoff.base_delay(), Duration::from_millis(500));
        assert_eq!(config.backoff.multiplier, 2.0);
        assert_eq!(
            config.runner.timeout_for("media.photo.upload.v1"),
            Duration::from_secs(120)
        );
        assert_eq!(
            config.runner.timeout_for("other"),
            Duration::from_secs(600)
        );
    }

    #[rstest]
    #[case::zero_pool("max_concurrency = 0", "max_concurrency")]
    #[case::huge_pool("max_concurrency = 4611686018427387904", "max_concurrency")]
    #[case::zero_tick("tick_interval_ms = 0", "tick_interval_ms")]
    #[case::zero_attempts("default_max_attempts = 0", "default_max_attempts")]
    #[case::shrinking("[backoff]\nmultiplier = 0.5", "backoff.multiplier")]
    #[case::jitter("[backoff]\njitter = 1.0", "backoff.jitter")]
    #[case::base_over_max("[backoff]\nbase_delay_ms = 10\nmax_delay_ms = 5", "backoff.base_delay_ms")]
    #[case::zero_timeout("[runner]\ndefault_timeout_ms = 0", "runner.default_timeout_ms")]
    fn invalid_values_are_rejected(#[case] toml: &str, #[case] expected: &str) {
        let err = SchedulerConfig::from_toml_str(toml).unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { field, .. } if field == expected),
            "{err}"
        );
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            SchedulerConfig::from_toml_str("max_concurrency = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workgate.toml");
        std::fs::write(&path, "tick_interval_ms = 250\n").unwrap();
        let config = SchedulerConfig::from_file(&path).unwrap();
        assert_eq!(config.tick_interval(), Duration::from_millis(250));

        assert!(matches!(
            SchedulerConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
