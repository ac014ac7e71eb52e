//! Retry schedule for failed CRM writes

use std::time::Duration;

use rand::Rng;

const DEFAULT_JITTER: f64 = 0.2;

/// Exponential backoff with a cap and proportional jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
            jitter: DEFAULT_JITTER,
        }
    }

    /// Replace the jitter fraction (0.0 disables it)
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether `attempts` calls used up the budget
    #[must_use]
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay before the attempt that follows failed attempt number `attempt`
    /// (1-based), honoring a server-provided minimum.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let nominal = self
            .base
            .saturating_mul(1_u32 << exponent)
            .min(self.cap);

        let delay = if self.jitter > 0.0 {
            let factor = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
            nominal.mul_f64(factor).min(self.cap)
        } else {
            nominal
        };

        retry_after.map_or(delay, |minimum| delay.max(minimum))
    }
}
