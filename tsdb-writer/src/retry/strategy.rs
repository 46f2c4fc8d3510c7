use std::time::Duration;

use rand::Rng;

use crate::config::WriteOptions;
use crate::error::WriteError;

/// Computes how long a failed batch waits before its next attempt.
///
/// The writer owns one strategy and calls [`success`](Self::success) after
/// every successful send.
pub trait RetryStrategy: Send {
    /// Delay before retrying after `failed_attempts` failures (1 on the first).
    fn next_delay(&mut self, error: &WriteError, failed_attempts: u32) -> Duration;

    /// Reset any backoff state.
    fn success(&mut self);
}

/// Randomized exponential backoff with an optional additive jitter.
///
/// The delay after `n` failures is drawn from
/// `[interval * base^n, interval * base^(n+1))`, capped at the maximum
/// interval, then jittered. When that range overflows or is empty (a base of
/// 1 or a zero interval) the delay is exactly the maximum interval, without
/// jitter. A retry-after hint carried by the error wins outright.
#[derive(Debug, Clone)]
pub struct ExponentialRetry {
    retry_interval: u64,
    exponential_base: u32,
    max_retry_interval: u64,
    retry_jitter: u64,
    current_delay: u64,
}

impl ExponentialRetry {
    /// Create a strategy from explicit millisecond values.
    pub fn new(
        retry_interval: Duration,
        exponential_base: u32,
        max_retry_interval: Duration,
        retry_jitter: Duration,
    ) -> Self {
        Self {
            retry_interval: millis(retry_interval),
            exponential_base,
            max_retry_interval: millis(max_retry_interval),
            retry_jitter: millis(retry_jitter),
            current_delay: 0,
        }
    }

    /// Create a strategy from the writer options.
    pub fn from_options(options: &WriteOptions) -> Self {
        Self::new(
            options.retry_interval(),
            options.exponential_base(),
            options.max_retry_interval(),
            options.retry_jitter(),
        )
    }

    /// The most recently computed delay, zero after a success.
    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(self.current_delay)
    }

    /// `[interval * base^n, interval * base^(n+1))`, or `None` when the terms
    /// overflow or the range is empty.
    fn backoff_range(&self, failed_attempts: u32) -> Option<(u64, u64)> {
        let base = u64::from(self.exponential_base);
        let low = base
            .checked_pow(failed_attempts)
            .and_then(|f| self.retry_interval.checked_mul(f))?;
        let high = failed_attempts
            .checked_add(1)
            .and_then(|n| base.checked_pow(n))
            .and_then(|f| self.retry_interval.checked_mul(f))?;
        (high > low).then_some((low, high))
    }
}

impl RetryStrategy for ExponentialRetry {
    fn next_delay(&mut self, error: &WriteError, failed_attempts: u32) -> Duration {
        if let Some(secs) = error.retry_after() {
            self.current_delay = secs.saturating_mul(1000);
            return Duration::from_millis(self.current_delay);
        }

        // An unusable range is clamped to the maximum with no jitter.
        let delay = match self.backoff_range(failed_attempts) {
            Some((low, high)) => {
                let delay = rand::rng()
                    .random_range(low..high)
                    .min(self.max_retry_interval);
                if self.retry_jitter > 0 {
                    delay.saturating_add(rand::rng().random_range(0..self.retry_jitter))
                } else {
                    delay
                }
            }
            None => self.max_retry_interval,
        };

        self.current_delay = delay;
        Duration::from_millis(delay)
    }

    fn success(&mut self) {
        self.current_delay = 0;
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
