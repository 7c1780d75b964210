//! Reconnect backoff for router and peer links

use std::time::Duration;

use rand::Rng;

/// Reconnect policy shared by the command channel and peer subscriptions
///
/// Controls how many consecutive connection attempts are made and how
/// long to wait between them using exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of consecutive failed attempts before giving up
    pub max_retries: u32,
    /// Base delay between attempts (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `failures` consecutive failures
    #[must_use]
    pub const fn allows(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}

/// Compute the delay before the next connection attempt.
///
/// Follows `min(base_delay * 2^attempt + jitter, max_delay)` where jitter is
/// 0-25% of the exponential base.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let base = base.min(policy.max_delay);

    let jitter_fraction = rand::thread_rng().gen_range(0.0..=0.25);
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}
