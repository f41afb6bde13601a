//! Exponential backoff for rule installation
//!
//! Shared by the onboarding coordinator (policy install: 1 s initial,
//! 30 s cap) and the traffic orchestrator (3 attempts, then fail closed).

use std::time::Duration;

/// Retry policy for switch operations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f32,
    /// Maximum backoff duration
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Orchestrator policy: 3 attempts before failing closed
    pub fn fail_closed() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(1),
        }
    }

    /// Onboarding policy install: 1 s initial, 30 s cap, alert after 5
    pub fn policy_install() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Backoff duration for a given attempt (0-based)
    ///
    /// ```text
    /// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
    /// ```
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let duration_ms = (self.initial_backoff.as_millis() as f32 * multiplier) as u64;
        Duration::from_millis(duration_ms.min(self.max_backoff.as_millis() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let policy = RetryPolicy::policy_install();
        assert_eq!(policy.backoff_duration(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_duration(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_duration(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_duration(3), Duration::from_secs(8));
    }

    #[test]
    fn test_cap_applied() {
        let policy = RetryPolicy::policy_install();
        assert_eq!(policy.backoff_duration(10), Duration::from_secs(30));
    }

    #[test]
    fn test_fail_closed_defaults() {
        let policy = RetryPolicy::fail_closed();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(200));
    }
}
