//! Exponential backoff for provider calls.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Randomizes each delay by up to +/- (factor * delay).
    #[serde(default = "default_jitter")]
    pub jitter_factor: f32,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> f32 {
    0.3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `failed_attempts` failures (1-based).
    ///
    /// `initial * 2^(failed_attempts - 1)`, capped at `max_delay_ms`, then jittered.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }
        let exp = (failed_attempts - 1).min(16);
        let base = self
            .initial_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);

        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter == 0.0 || base == 0 {
            return Duration::from_millis(base);
        }
        let range = (base as f64 * jitter as f64) as u64;
        let offset = rand::rng().random_range(0..=range * 2);
        Duration::from_millis(base.saturating_sub(range).saturating_add(offset))
    }

    /// A server hint overrides the computed delay, still bounded by `max_delay_ms`.
    pub fn delay_with_hint(&self, failed_attempts: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(h) => h.min(Duration::from_millis(self.max_delay_ms)),
            None => self.delay_after(failed_attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = no_jitter();
        assert_eq!(policy.delay_after(0), Duration::ZERO);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter_factor: 0.5,
            ..no_jitter()
        };
        for _ in 0..100 {
            let d = policy.delay_after(2).as_millis();
            assert!((100..=300).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn test_hint_is_bounded() {
        let policy = no_jitter();
        assert_eq!(
            policy.delay_with_hint(1, Some(Duration::from_secs(60))),
            Duration::from_millis(1000)
        );
        assert_eq!(
            policy.delay_with_hint(1, Some(Duration::from_millis(50))),
            Duration::from_millis(50)
        );
    }
}
