//! Retry delay policy.
//!
//! The backoff formula is deliberately pluggable: the engine only asks
//! "how long until retry number N", and routes the exhaustion decision
//! (error vs dead) itself.

use chrono::Duration;
use rand::Rng;

pub trait RetryPolicy: Send + Sync {
    /// Delay before retry number `retry_count` (1-based: the first retry
    /// after the first failure passes 1).
    fn delay(&self, retry_count: u32) -> Duration;
}

/// Exponential backoff with a ceiling and proportional jitter.
///
/// delay = min(base * multiplier^(retry_count - 1), max_delay), then
/// scaled by a random factor in [1 - jitter, 1 + jitter].
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Proportional jitter, e.g. 0.25 for ±25%. Zero disables it.
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::seconds(2),
            multiplier: 2.0,
            max_delay: Duration::hours(1),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.base.num_milliseconds() as f64;
        let mut delay_ms = base_ms * self.multiplier.powi(exponent);

        let max_ms = self.max_delay.num_milliseconds() as f64;
        if !delay_ms.is_finite() || delay_ms > max_ms {
            delay_ms = max_ms;
        }

        if self.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            delay_ms *= factor;
        }

        Duration::milliseconds(delay_ms.round() as i64)
    }
}

/// Constant delay. Used by tests and cron-style deployments that prefer a
/// predictable cadence.
#[derive(Debug, Clone)]
pub struct FixedDelay(pub Duration);

impl RetryPolicy for FixedDelay {
    fn delay(&self, _retry_count: u32) -> Duration {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ExponentialBackoff {
        ExponentialBackoff {
            jitter: 0.0,
            ..ExponentialBackoff::default()
        }
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let policy = no_jitter();
        assert_eq!(policy.delay(1), Duration::seconds(2));
        assert_eq!(policy.delay(2), Duration::seconds(4));
        assert_eq!(policy.delay(3), Duration::seconds(8));
        assert_eq!(policy.delay(4), Duration::seconds(16));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let policy = ExponentialBackoff {
            max_delay: Duration::seconds(30),
            jitter: 0.0,
            ..ExponentialBackoff::default()
        };
        assert_eq!(policy.delay(10), Duration::seconds(30));
        // Large retry counts must not overflow the float math.
        assert_eq!(policy.delay(u32::MAX), Duration::seconds(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = ExponentialBackoff::default();
        for _ in 0..100 {
            let d = policy.delay(3).num_milliseconds();
            // 8s nominal, ±25%
            assert!((6_000..=10_000).contains(&d), "delay {d}ms out of bounds");
        }
    }

    #[test]
    fn fixed_delay_ignores_retry_count() {
        let policy = FixedDelay(Duration::seconds(5));
        assert_eq!(policy.delay(1), Duration::seconds(5));
        assert_eq!(policy.delay(99), Duration::seconds(5));
    }
}
