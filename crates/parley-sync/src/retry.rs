//! Capped exponential backoff for live-feed reconnects.

use std::time::Duration;

use backoff::backoff::Backoff;
use serde::{Deserialize, Serialize};

/// Delay before retry number `attempt` (1-based).
///
/// `min(base_delay_ms * multiplier^(attempt - 1), max_delay_ms)`. Attempt 0 is
/// treated as 1. The result saturates instead of overflowing for large
/// attempts.
pub fn retry_delay(attempt: u32, base_delay_ms: u64, multiplier: f64, max_delay_ms: u64) -> u64 {
    let exponent = attempt.max(1) - 1;
    let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
    let raw = base_delay_ms as f64 * multiplier.powi(exponent);

    if raw.is_nan() || raw >= max_delay_ms as f64 {
        max_delay_ms
    } else if raw <= 0.0 {
        0
    } else {
        raw as u64
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

/// Retry parameters for live feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Reconnect attempts allowed between two successful snapshots.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(retry_delay(
            attempt,
            self.base_delay_ms,
            self.multiplier,
            self.max_delay_ms,
        ))
    }

    /// A fresh backoff sequence for this policy.
    pub fn backoff(&self) -> FeedBackoff {
        FeedBackoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// [`Backoff`] driven by a [`RetryPolicy`].
///
/// Yields `policy.delay(1)`, `policy.delay(2)`, ... and `None` once
/// `max_attempts` delays have been handed out.
#[derive(Debug, Clone)]
pub struct FeedBackoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl FeedBackoff {
    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Backoff for FeedBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.policy.delay(self.attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence() {
        let delays: Vec<u64> = (1..=7).map(|n| retry_delay(n, 1000, 2.0, 30_000)).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn test_attempt_zero_is_first_attempt() {
        assert_eq!(retry_delay(0, 1000, 2.0, 30_000), 1000);
    }

    #[test]
    fn test_huge_attempt_saturates() {
        assert_eq!(retry_delay(u32::MAX, 1000, 2.0, 30_000), 30_000);
        assert_eq!(retry_delay(10_000, u64::MAX, 10.0, u64::MAX), u64::MAX);
    }

    #[test]
    fn test_backoff_stops_after_max_attempts() {
        let policy = RetryPolicy::default();
        let mut backoff = policy.backoff();

        let delays: Vec<Duration> = std::iter::from_fn(|| backoff.next_backoff()).collect();
        assert_eq!(delays.len(), 5);
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[4], Duration::from_secs(16));
        assert_eq!(backoff.next_backoff(), None);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 2}"#).unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 30_000);
    }
}
