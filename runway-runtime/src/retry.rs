//! Retry logic for transient unit failures

use runway_core::RetrySettings;
use std::time::Duration;

/// Retry strategy for failed steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// No retries
    None,

    /// Fixed delay between retries
    Fixed,

    /// Exponential backoff, capped at `max_delay`
    Exponential,
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    pub strategy: RetryStrategy,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            strategy: if settings.max_attempts == 0 {
                RetryStrategy::None
            } else {
                RetryStrategy::Exponential
            },
            backoff_multiplier: settings.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            strategy: RetryStrategy::None,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        match self.strategy {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed => self.initial_delay.min(self.max_delay),
            RetryStrategy::Exponential => {
                let delay =
                    self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(retry as i32);
                Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
            }
        }
    }

    /// Whether another retry is allowed after `retries` retries
    pub fn should_retry(&self, retries: u32) -> bool {
        self.strategy != RetryStrategy::None && retries < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.strategy, RetryStrategy::Exponential);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(0));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };

        assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Fixed,
            initial_delay: Duration::from_secs(5),
            ..Default::default()
        };

        assert_eq!(policy.calculate_delay(0), Duration::from_secs(5));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(5));
    }

    #[test]
    fn test_from_settings() {
        let settings = RetrySettings {
            max_attempts: 0,
            ..RetrySettings::default()
        };
        assert_eq!(RetryPolicy::from(&settings).strategy, RetryStrategy::None);
    }
}
