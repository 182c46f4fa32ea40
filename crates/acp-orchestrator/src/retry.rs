// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exponential backoff with jitter for tool invocations.
//!
//! Only transport-level failures and failures the endpoint marks retryable
//! are retried, and only for idempotent calls. The policy computes delays;
//! the orchestrator decides eligibility.

use acp_config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Backoff policy derived from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// First delay.
    pub base_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
    /// Jitter as a fraction of the computed delay (0.0–1.0).
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    /// Build a policy from configuration.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// The backoff before retry number `attempt` (1-based: the delay taken
    /// after the `attempt`-th failure), with jitter applied.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.as_millis() as u64 * (1_u64 << exp);
        let capped = raw.min(self.max_delay.as_millis() as u64);

        if self.jitter_ratio <= f64::EPSILON || capped == 0 {
            return Duration::from_millis(capped);
        }
        let spread = (capped as f64 * self.jitter_ratio) as u64;
        let jittered = if spread == 0 {
            capped
        } else {
            let offset = rand::thread_rng().gen_range(0..=2 * spread);
            capped - spread + offset
        };
        Duration::from_millis(jittered)
    }

    /// Whether another attempt is allowed after `attempts_done` tries.
    #[must_use]
    pub fn allows_retry(&self, attempts_done: u32) -> bool {
        attempts_done < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn delays_double_until_capped() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(50), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy {
            jitter_ratio: 0.5,
            ..no_jitter()
        };
        for _ in 0..100 {
            let d = policy.delay_for(2).as_millis() as u64;
            assert!((100..=300).contains(&d), "delay {d} outside band");
        }
    }

    #[test]
    fn attempt_budget() {
        let policy = no_jitter();
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
    }

    #[test]
    fn config_conversion_clamps_jitter() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 2,
            base_delay_ms: 10,
            max_delay_ms: 20,
            jitter_ratio: 7.0,
        });
        assert!((policy.jitter_ratio - 1.0).abs() < f64::EPSILON);
    }
}
