/// Exponential backoff with jitter.
///
/// Implements the AWS-recommended Full Jitter strategy. Shared by the
/// context-store CAS loop, the GPU arbiter's acquire wait, and the stage
/// scheduler's re-dispatch delay.
use std::time::Duration;

use rand::Rng;

/// Retry strategy settings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub(crate) max_attempts: usize,
    /// Base delay in milliseconds.
    pub(crate) base_delay_ms: u64,
    /// Maximum delay in milliseconds.
    pub(crate) max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 10000,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub(crate) const fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay to wait before the given attempt (Full Jitter).
    ///
    /// # Arguments
    /// * `attempt` - attempt counter, starting at 0
    #[must_use]
    pub(crate) fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        // Exponential backoff: base * 2^(attempt-1)
        let exponential_delay = self
            .base_delay_ms
            .saturating_mul(1_u64.checked_shl((attempt - 1) as u32).unwrap_or(u64::MAX));

        let capped_delay = exponential_delay.min(self.max_delay_ms);

        // Full Jitter: random(0, capped_delay)
        let jittered_delay = if capped_delay > 0 {
            let mut rng = rand::rng();
            rng.random_range(0..=capped_delay)
        } else {
            0
        };

        Duration::from_millis(jittered_delay)
    }

    /// Whether another attempt is permitted after `attempt` tries.
    #[must_use]
    pub(crate) const fn can_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_for_attempt_zero_is_zero() {
        let config = RetryConfig::default();
        let delay = config.delay_for_attempt(0);
        assert_eq!(delay, Duration::from_millis(0));
    }

    #[test]
    fn delay_for_attempt_increases_exponentially() {
        let config = RetryConfig::new(5, 100, 10000);

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(0));

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 <= Duration::from_millis(100));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 <= Duration::from_millis(200));

        let delay3 = config.delay_for_attempt(3);
        assert!(delay3 <= Duration::from_millis(400));
    }

    #[test]
    fn delay_for_attempt_respects_max_delay() {
        let config = RetryConfig::new(10, 100, 500);

        let delay = config.delay_for_attempt(10);
        assert!(delay <= Duration::from_millis(500));
    }

    #[test]
    fn can_retry_respects_max_attempts() {
        let config = RetryConfig::new(3, 100, 1000);

        assert!(config.can_retry(0));
        assert!(config.can_retry(1));
        assert!(config.can_retry(2));
        assert!(!config.can_retry(3));
        assert!(!config.can_retry(4));
    }

    #[test]
    fn full_jitter_provides_variation() {
        let config = RetryConfig::new(5, 100, 10000);

        let delays: Vec<Duration> = (0..10).map(|_| config.delay_for_attempt(3)).collect();

        let all_same = delays.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_same, "jitter should produce varying delays");
    }
}
