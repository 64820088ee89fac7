//! Exponential backoff between job attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Schedule for requeueing retryable failures.
///
/// Attempt `n` (1-based) that fails retryably is released for
/// `initial_delay * multiplier^(n-1)`, capped at `max_delay`. After
/// `max_attempts` attempts the job fails permanently.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
}

impl BackoffConfig {
    /// 1s, 2s, 4s, 8s between five attempts, capped at five minutes.
    pub const DEFAULT: Self = Self {
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(300),
        multiplier: 2.0,
        max_attempts: 5,
    };

    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            max_attempts,
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        if capped_secs.is_finite() && capped_secs >= 0.0 {
            Duration::from_secs_f64(capped_secs)
        } else {
            self.max_delay
        }
    }

    /// Whether a job that just failed attempt `attempt` may be retried.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially() {
        let config = BackoffConfig::DEFAULT;
        let delays: Vec<_> = (1..=4).map(|n| config.delay_for_attempt(n)).collect();
        assert_eq!(
            delays,
            [
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
    }

    #[test]
    fn delays_are_capped() {
        let config = BackoffConfig::new(
            Duration::from_secs(10),
            Duration::from_secs(30),
            3.0,
            10,
        );
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn retry_is_allowed_below_the_attempt_limit() {
        let config = BackoffConfig {
            max_attempts: 3,
            ..BackoffConfig::DEFAULT
        };
        assert!(config.allows_retry(1));
        assert!(config.allows_retry(2));
        assert!(!config.allows_retry(3));
    }
}
