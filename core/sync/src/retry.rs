//! Retry accounting and linear backoff for queued writes.

use std::time::Duration;

use crate::config::SyncConfig;

/// Retry ceiling and backoff schedule for the pending queue.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per operation before it is evicted.
    pub max_retries: u32,
    /// Backoff base; the delay is `base × retry count`.
    pub base_delay: Duration,
    /// Maximum delay (cap for linear growth).
    pub max_delay: Duration,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a new policy with the given ceiling.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }

    /// Set the backoff base.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next re-drain, given the global retry count.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let linear = self.base_delay.saturating_mul(retry_count.max(1));
        let capped = linear.min(self.max_delay);

        if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped.mul_f64(jitter_factor)
        } else {
            capped
        }
    }

    /// Whether an operation that has failed `retry_count` times must be evicted.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self::new(config.max_retries)
            .with_base_delay(config.retry_base_delay)
            .with_max_delay(config.max_retry_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_delay_calculation() {
        let policy = RetryPolicy::new(3).with_base_delay(Duration::from_secs(2));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(6));
    }

    #[test]
    fn test_zero_count_waits_one_base() {
        let policy = RetryPolicy::new(3).with_base_delay(Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::new(10)
            .with_base_delay(Duration::from_secs(5))
            .with_max_delay(Duration::from_secs(12));

        assert_eq!(policy.delay_for_attempt(100), Duration::from_secs(12));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(3)
            .with_base_delay(Duration::from_secs(4))
            .with_jitter(true);

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_secs(3));
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_exhaustion_at_ceiling() {
        let policy = RetryPolicy::new(3);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }

    #[test]
    fn test_from_config() {
        let config = SyncConfig::default()
            .with_max_retries(5)
            .with_retry_base_delay(Duration::from_millis(250));
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
    }
}
