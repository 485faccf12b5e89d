//! Exponential backoff for transient failures
//!
//! Each room, publish channel and play stream owns its own [`Backoff`]. A
//! fresh one is created for every request loop, which resets the attempt
//! count after any successful transition.

use std::time::Duration;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Growth factor between retries
    pub multiplier: u32,

    /// Upper bound of a single delay
    pub max_delay: Duration,

    /// Retries before giving up (None = retry forever)
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(32),
            max_attempts: Some(10),
        }
    }
}

impl RetryPolicy {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Retry forever
    pub fn unbounded(self) -> Self {
        self.max_attempts(None)
    }
}

/// Attempt counter for one request loop
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next retry, or None once the attempts are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        let factor = self
            .policy
            .multiplier
            .checked_pow(self.attempt)
            .unwrap_or(u32::MAX);
        let delay = self
            .policy
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.policy.max_delay)
            .min(self.policy.max_delay);

        self.attempt += 1;
        Some(delay)
    }

    /// Retries issued so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, Some(10));
    }

    #[test]
    fn test_delays_double_until_cap() {
        let mut backoff = Backoff::new(RetryPolicy::default());
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32, 32, 32, 32]);
        assert_eq!(backoff.attempt(), 10);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(RetryPolicy::default().max_attempts(Some(1)));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_unbounded_never_gives_up() {
        let mut backoff = Backoff::new(RetryPolicy::default().unbounded());
        for _ in 0..100 {
            assert!(backoff.next_delay().is_some());
        }
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(32)));
    }

    #[test]
    fn test_builder() {
        let policy = RetryPolicy::default()
            .initial_delay(Duration::from_millis(100))
            .multiplier(0)
            .max_delay(Duration::from_millis(150));
        assert_eq!(policy.multiplier, 1);

        let mut backoff = Backoff::new(policy.multiplier(3));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(150)));
    }
}
