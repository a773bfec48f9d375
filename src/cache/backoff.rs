//! Exponential backoff with jitter for refresh retries.

use std::time::Duration;

use rand::Rng;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_MS: u64 = 500;
const DEFAULT_MAX_MS: u64 = 10_000;
const DEFAULT_JITTER: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `[0, 1]`; each delay is scaled by a factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_MS),
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt `attempt` (1-based), without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return nominal;
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::try_from_secs_f64(nominal.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }

    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}
