//! 재시도 정책
//!
//! Exponential backoff for failed work-queue tasks: `base * 2^attempts`,
//! capped, with optional uniform jitter.

use std::time::Duration;

use crate::infrastructure::config::QueueConfig;

/// What the queue should do with a task that just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs(config.backoff_base_seconds),
            max_delay: Duration::from_secs(config.backoff_cap_seconds),
            jitter: Duration::from_millis(config.backoff_jitter_ms),
        }
    }

    /// Backoff before the next attempt, given the attempt count after the failure
    pub fn delay_for(&self, attempts: u32) -> Duration {
        // 2^31 seconds already exceeds any sane cap
        let factor = 1u32.checked_shl(attempts.min(31)).unwrap_or(u32::MAX);
        let exponential = self.base_delay.saturating_mul(factor);
        let capped = exponential.min(self.max_delay);

        if self.jitter.is_zero() {
            capped
        } else {
            let jitter_ms = fastrand::u64(0..=self.jitter.as_millis() as u64);
            capped + Duration::from_millis(jitter_ms)
        }
    }

    /// `attempts` is the count including the failure being recorded
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        if attempts >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.delay_for(attempts))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            jitter: Duration::ZERO,
        }
    }

    #[rstest]
    #[case(1, 60)]
    #[case(2, 120)]
    #[case(3, 240)]
    #[case(4, 480)]
    #[case(7, 3600)]
    #[case(40, 3600)]
    fn exponential_delay_is_capped(#[case] attempts: u32, #[case] expected_secs: u64) {
        assert_eq!(policy().delay_for(attempts), Duration::from_secs(expected_secs));
    }

    #[test]
    fn gives_up_at_the_attempt_ceiling() {
        let policy = policy();
        assert_eq!(policy.decide(4), RetryDecision::RetryAfter(Duration::from_secs(480)));
        assert_eq!(policy.decide(5), RetryDecision::GiveUp);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: Duration::from_millis(250),
            ..policy()
        };
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_secs(60));
            assert!(delay <= Duration::from_secs(60) + Duration::from_millis(250));
        }
    }
}
