use bytes::Bytes;
use tokio::time::{Duration, Instant};

/// A bundle of lines handed to the transport as a single write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub lines: Bytes,
    pub remaining_attempts: u32,
    pub expires_at: Instant,
}

impl Batch {
    /// Create a fresh batch that may be retried `max_retries` times within
    /// `max_retry_time` from now.
    pub fn new(lines: Bytes, max_retries: u32, max_retry_time: Duration) -> Self {
        Self {
            lines,
            remaining_attempts: max_retries,
            expires_at: deadline(Instant::now(), max_retry_time),
        }
    }

    /// Check whether the batch is past its retry deadline.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// `now + after`, saturating at roughly thirty years out.
pub(crate) fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .unwrap_or_else(|| now + Duration::from_secs(30 * 365 * 24 * 60 * 60))
}
