//! Backoff policy: decides retry delays.

use std::time::Duration;

use rand::Rng;

use crate::app::config::BackoffConfig;

/// Exponential backoff with a ceiling and jitter.
///
/// Example with base_delay=2s, multiplier=2.0, max_delay=30s:
/// - attempt 1 (first failure): 2s
/// - attempt 2: 4s
/// - attempt 3: 8s
/// - attempt 4: 16s
/// - attempt 5: 30s (capped)
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,

    /// Relative jitter, e.g. 0.2 for ±20%.
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter: 0.2,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.base_delay(), config.multiplier, config.max_delay())
            .with_jitter(config.jitter)
    }

    /// `min(base_delay * multiplier^(attempt - 1), max_delay)`, no jitter.
    ///
    /// `attempt` is the number of attempts already made (1-indexed); 0 is
    /// treated like 1.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max_secs {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay before the next attempt: nominal delay with jitter, never above
    /// `max_delay`.
    ///
    /// Jitter comes from the thread-local RNG (seeded from OS entropy), so
    /// tasks that failed together spread out instead of retrying in lockstep.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        nominal.mul_f64(factor).min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(2), 2.0, Duration::from_secs(30)).with_jitter(0.0)
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(4, 16)]
    #[case(5, 30)]
    #[case(40, 30)]
    fn exponential_with_cap(#[case] attempt: u32, #[case] secs: u64) {
        assert_eq!(policy().nominal_delay(attempt), Duration::from_secs(secs));
        assert_eq!(policy().next_delay(attempt), Duration::from_secs(secs));
    }

    #[test]
    fn nominal_delay_is_monotonic_and_bounded() {
        let p = policy();
        let mut prev = Duration::ZERO;
        for attempt in 1..200 {
            let d = p.nominal_delay(attempt);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            assert!(d <= p.max_delay);
            prev = d;
        }
    }

    #[test]
    fn jitter_stays_within_band_and_cap() {
        let p = policy().with_jitter(0.2);
        for attempt in 1..8 {
            let nominal = p.nominal_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let d = p.next_delay(attempt);
                assert!(d <= p.max_delay);
                let secs = d.as_secs_f64();
                assert!(secs >= nominal * 0.8 - 1e-9, "{secs} < 0.8 * {nominal}");
                assert!(secs <= nominal * 1.2 + 1e-9, "{secs} > 1.2 * {nominal}");
            }
        }
    }

    #[test]
    fn multiplier_of_one_is_constant() {
        let p = BackoffPolicy::new(Duration::from_millis(500), 1.0, Duration::from_secs(10))
            .with_jitter(0.0);
        assert_eq!(p.nominal_delay(1), p.nominal_delay(9));
    }
}
