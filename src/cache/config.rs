//! Refresh scheduling configuration.
//!
//! Derived from the `[refresh]` section of `dashcache.toml`.

use std::time::Duration;

use super::backoff::RetryPolicy;

const DEFAULT_TICK_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshConfig {
    /// Interval of the periodic staleness sweep.
    pub tick: Duration,
    pub retry: RetryPolicy,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(DEFAULT_TICK_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&crate::config::RefreshSettings> for RefreshConfig {
    fn from(settings: &crate::config::RefreshSettings) -> Self {
        Self {
            tick: Duration::from_secs(u64::from(settings.tick_seconds.get())),
            retry: RetryPolicy {
                max_attempts: settings.max_attempts.get(),
                base_delay: Duration::from_millis(settings.backoff_base_ms),
                max_delay: Duration::from_millis(settings.backoff_max_ms),
                jitter: settings.jitter,
            },
        }
    }
}
