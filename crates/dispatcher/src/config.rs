//! Runtime settings for the dispatcher, worker pool, and status reporter.

use std::time::Duration;

use bridge::{BackoffPolicy, ConfigError};

/// Default number of concurrent dispatch workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default interval between sweeps of the pending queue when idle.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default per-attempt HTTP timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval at which subscriptions re-read task state.
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Tuning for the dispatcher, its worker pool and status subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub workers: usize,
    /// Upper bound on the sleep between sweeps when nothing wakes the pool.
    pub poll_interval: Duration,
    /// Bounds a single delivery attempt; distinct from the retry budget.
    pub attempt_timeout: Duration,
    /// How often a subscription re-reads its task.
    pub status_poll_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            status_poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::new("dispatch.workers must be at least 1"));
        }
        for (name, value) in [
            ("dispatch.poll_interval_ms", self.poll_interval),
            ("dispatch.attempt_timeout_ms", self.attempt_timeout),
            ("dispatch.status_poll_interval_ms", self.status_poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::new(format!("{name} must be greater than zero")));
            }
        }
        self.backoff.validate()
    }
}
