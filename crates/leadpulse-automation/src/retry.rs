//! Retry policy for failed dispatches.

use chrono::{DateTime, Duration, Utc};
use leadpulse_core::config::RetryConfig;

use crate::execution::FailureTransition;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total dispatch attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay before each re-attempt; the last entry repeats.
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config
                .backoff_secs
                .iter()
                .map(|s| Duration::seconds(*s as i64))
                .collect(),
        }
    }

    /// Delay after the `failures`-th failed attempt (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        if self.backoff.is_empty() {
            return Duration::zero();
        }
        let idx = (failures.max(1) as usize - 1).min(self.backoff.len() - 1);
        self.backoff[idx]
    }

    /// Decide the next state given the failure count *including* this failure.
    pub fn decide(&self, failures: u32, retryable: bool, now: DateTime<Utc>) -> FailureTransition {
        if retryable && failures < self.max_attempts {
            FailureTransition::Retry {
                next_fire_at: now + self.backoff(failures),
            }
        } else {
            FailureTransition::Terminal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        assert_eq!(
            policy.decide(1, true, now),
            FailureTransition::Retry { next_fire_at: now + Duration::hours(1) }
        );
        assert_eq!(
            policy.decide(2, true, now),
            FailureTransition::Retry { next_fire_at: now + Duration::hours(4) }
        );
        assert_eq!(policy.decide(3, true, now), FailureTransition::Terminal);
    }

    #[test]
    fn test_permanent_is_terminal_immediately() {
        let now = Utc::now();
        assert_eq!(RetryPolicy::default().decide(1, false, now), FailureTransition::Terminal);
    }

    #[test]
    fn test_last_backoff_repeats() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 10,
            backoff_secs: vec![60, 120],
        });
        assert_eq!(policy.backoff(1), Duration::seconds(60));
        assert_eq!(policy.backoff(5), Duration::seconds(120));

        let empty = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 2,
            backoff_secs: vec![],
        });
        assert_eq!(empty.backoff(1), Duration::zero());
    }
}
