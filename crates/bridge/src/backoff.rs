//! Exponential backoff with jitter for dispatch retries.
//!
//! ```text
//! attempt   un-jittered delay (base=1s, cap=30s)
//! ────────────────────────────────────────────
//!    1          1s
//!    2          2s
//!    3          4s
//!    4          8s
//!    5         16s
//!   >5         30s (cap)
//! ```
//!
//! Jitter scales each delay by a uniform factor in `[1 - jitter, 1 + jitter]`
//! and the result is re-capped at `max_delay`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Default number of dispatch attempts per task (including the first).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default ceiling for any single retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default jitter factor (±20%).
pub const DEFAULT_JITTER: f64 = 0.2;

/// Retry budget and delay schedule for one task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts allowed, first attempt included. Always `>= 1`.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `[0.0, 1.0]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl std::fmt::Display for BackoffPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BackoffPolicy(max_attempts={}, base={:?}, cap={:?}, jitter={:.0}%)",
            self.max_attempts,
            self.base_delay,
            self.max_delay,
            self.jitter * 100.0
        )
    }
}

impl BackoffPolicy {
    /// Checks the invariants listed on the fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::new("retry.max_attempts must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::new(
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::new("retry.jitter must be within [0.0, 1.0]"));
        }
        Ok(())
    }

    /// Returns `true` if a task that has made `attempts` attempts may make
    /// another.
    pub fn has_budget(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// The delay after attempt number `attempt` (1-based) before jitter:
    /// `min(base * 2^(attempt-1), max)`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// The jittered delay to wait after attempt number `attempt` failed.
    ///
    /// `floor` (typically a `Retry-After` hint) raises the delay but never
    /// past `max_delay`.
    pub fn delay_after(&self, attempt: u32, floor: Option<Duration>) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jittered = if self.jitter > 0.0 && !nominal.is_zero() {
            let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
            nominal.mul_f64(factor)
        } else {
            nominal
        };
        jittered.max(floor.unwrap_or_default()).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter,
        }
    }

    #[test]
    fn nominal_delay_doubles_then_caps() {
        let p = policy(0.0);
        let schedule: Vec<u64> = (1..=7).map(|n| p.nominal_delay(n).as_secs()).collect();
        assert_eq!(schedule, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        assert_eq!(policy(0.0).nominal_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_band_and_cap() {
        let p = policy(0.2);
        for _ in 0..200 {
            let d = p.delay_after(3, None);
            assert!(d >= Duration::from_millis(3200), "{d:?} below band");
            assert!(d <= Duration::from_millis(4800), "{d:?} above band");
            assert!(p.delay_after(10, None) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn retry_after_floor_raises_delay_but_respects_cap() {
        let p = policy(0.0);
        assert_eq!(p.delay_after(1, Some(Duration::from_secs(5))), Duration::from_secs(5));
        assert_eq!(p.delay_after(1, Some(Duration::from_secs(120))), Duration::from_secs(30));
    }

    #[test]
    fn budget_counts_the_first_attempt() {
        let p = BackoffPolicy {
            max_attempts: 3,
            ..policy(0.0)
        };
        assert!(p.has_budget(0));
        assert!(p.has_budget(2));
        assert!(!p.has_budget(3));
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(BackoffPolicy::default().validate().is_ok());
        assert!(BackoffPolicy {
            max_attempts: 0,
            ..policy(0.0)
        }
        .validate()
        .is_err());
        assert!(BackoffPolicy {
            jitter: 1.5,
            ..policy(0.0)
        }
        .validate()
        .is_err());
        assert!(BackoffPolicy {
            base_delay: Duration::from_secs(60),
            ..policy(0.0)
        }
        .validate()
        .is_err());
    }
}
