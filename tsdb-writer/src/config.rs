use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WriteError, WriteResult};

/// Options controlling batching and retry behaviour of a [`PointsWriter`].
///
/// Durations are stored in milliseconds so the options can be loaded from
/// any serde format. Missing fields fall back to the defaults.
///
/// [`PointsWriter`]: crate::writer::PointsWriter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    batch_size: usize,
    max_batch_bytes: usize,
    flush_interval: u64,
    max_retries: u32,
    retry_buffer_limit: usize,
    retry_interval: u64,
    exponential_base: u32,
    max_retry_interval: u64,
    retry_jitter: u64,
    max_retry_time: u64,
    channel_capacity: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            batch_size: 5_000,
            max_batch_bytes: 50_000_000,
            flush_interval: 1_000,
            max_retries: 5,
            retry_buffer_limit: 50_000,
            retry_interval: 5_000,
            exponential_base: 2,
            max_retry_interval: 125_000,
            retry_jitter: 0,
            max_retry_time: 180_000,
            channel_capacity: 1,
        }
    }
}

impl WriteOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of lines per batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the maximum number of bytes accumulated before a forced flush.
    pub fn with_max_batch_bytes(mut self, max_batch_bytes: usize) -> Self {
        self.max_batch_bytes = max_batch_bytes;
        self
    }

    /// Set the periodic flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = duration_ms(interval);
        self
    }

    /// Set the number of retries a batch gets after its first failure.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the retry buffer capacity, in lines.
    pub fn with_retry_buffer_limit(mut self, limit: usize) -> Self {
        self.retry_buffer_limit = limit;
        self
    }

    /// Set the base retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = duration_ms(interval);
        self
    }

    /// Set the base of the exponential backoff.
    pub fn with_exponential_base(mut self, base: u32) -> Self {
        self.exponential_base = base;
        self
    }

    /// Set the upper bound of a single backoff delay.
    pub fn with_max_retry_interval(mut self, interval: Duration) -> Self {
        self.max_retry_interval = duration_ms(interval);
        self
    }

    /// Set the exclusive upper bound of the random jitter added to each delay.
    pub fn with_retry_jitter(mut self, jitter: Duration) -> Self {
        self.retry_jitter = duration_ms(jitter);
        self
    }

    /// Set how long a batch may keep being retried after it was produced.
    pub fn with_max_retry_time(mut self, max_retry_time: Duration) -> Self {
        self.max_retry_time = duration_ms(max_retry_time);
        self
    }

    /// Set the capacity of the bounded channels between the pipeline stages.
    ///
    /// A full channel blocks the upstream stage; this is the only
    /// backpressure the writer applies.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Get the maximum number of lines per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Get the maximum batch size in bytes.
    pub fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }

    /// Get the flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval)
    }

    /// Get the maximum number of retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Get the retry buffer capacity, in lines.
    pub fn retry_buffer_limit(&self) -> usize {
        self.retry_buffer_limit
    }

    /// Get the base retry interval.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval)
    }

    /// Get the exponential backoff base.
    pub fn exponential_base(&self) -> u32 {
        self.exponential_base
    }

    /// Get the maximum retry interval.
    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_millis(self.max_retry_interval)
    }

    /// Get the retry jitter bound.
    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter)
    }

    /// Get the maximum retry time.
    pub fn max_retry_time(&self) -> Duration {
        Duration::from_millis(self.max_retry_time)
    }

    /// Get the inter-stage channel capacity.
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    /// Check the options for values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Configuration`] naming the first invalid option.
    pub fn validate(&self) -> WriteResult<()> {
        let invalid = |message: &str| {
            Err(WriteError::Configuration {
                message: message.to_string(),
            })
        };

        if self.batch_size == 0 {
            return invalid("batch_size must be greater than zero");
        }
        if self.max_batch_bytes == 0 {
            return invalid("max_batch_bytes must be greater than zero");
        }
        if self.flush_interval == 0 {
            return invalid("flush_interval must be greater than zero");
        }
        if self.retry_buffer_limit == 0 {
            return invalid("retry_buffer_limit must be greater than zero");
        }
        if self.exponential_base == 0 {
            return invalid("exponential_base must be at least 1");
        }
        if self.channel_capacity == 0 {
            return invalid("channel_capacity must be greater than zero");
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = WriteOptions::default();
        assert_eq!(options.batch_size(), 5_000);
        assert_eq!(options.flush_interval(), Duration::from_secs(1));
        assert_eq!(options.max_retries(), 5);
        assert_eq!(options.retry_buffer_limit(), 50_000);
        assert_eq!(options.retry_interval(), Duration::from_secs(5));
        assert_eq!(options.exponential_base(), 2);
        assert_eq!(options.max_retry_interval(), Duration::from_secs(125));
        assert_eq!(options.retry_jitter(), Duration::ZERO);
        assert_eq!(options.max_retry_time(), Duration::from_secs(180));
        assert_eq!(options.channel_capacity(), 1);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_options_builder() {
        let options = WriteOptions::new()
            .with_batch_size(10)
            .with_max_batch_bytes(1024)
            .with_flush_interval(Duration::from_millis(250))
            .with_max_retries(3)
            .with_retry_buffer_limit(100)
            .with_retry_interval(Duration::from_millis(50))
            .with_exponential_base(3)
            .with_max_retry_interval(Duration::from_secs(2))
            .with_retry_jitter(Duration::from_millis(20))
            .with_max_retry_time(Duration::from_secs(10))
            .with_channel_capacity(4);

        assert_eq!(options.batch_size(), 10);
        assert_eq!(options.max_batch_bytes(), 1024);
        assert_eq!(options.flush_interval(), Duration::from_millis(250));
        assert_eq!(options.max_retries(), 3);
        assert_eq!(options.retry_buffer_limit(), 100);
        assert_eq!(options.retry_interval(), Duration::from_millis(50));
        assert_eq!(options.exponential_base(), 3);
        assert_eq!(options.max_retry_interval(), Duration::from_secs(2));
        assert_eq!(options.retry_jitter(), Duration::from_millis(20));
        assert_eq!(options.max_retry_time(), Duration::from_secs(10));
        assert_eq!(options.channel_capacity(), 4);
    }

    #[test]
    fn test_options_from_json_uses_defaults_for_missing_fields() {
        let options: WriteOptions =
            serde_json::from_str(r#"{"batch_size": 20, "max_retry_time": 500}"#).unwrap();

        assert_eq!(options.batch_size(), 20);
        assert_eq!(options.max_retry_time(), Duration::from_millis(500));
        assert_eq!(options.max_retries(), 5);
        assert_eq!(options.flush_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(matches!(
            WriteOptions::new().with_batch_size(0).validate(),
            Err(WriteError::Configuration { .. })
        ));
        assert!(WriteOptions::new()
            .with_max_batch_bytes(0)
            .validate()
            .is_err());
        assert!(WriteOptions::new()
            .with_flush_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(WriteOptions::new()
            .with_retry_buffer_limit(0)
            .validate()
            .is_err());
        assert!(WriteOptions::new()
            .with_exponential_base(0)
            .validate()
            .is_err());
        assert!(WriteOptions::new()
            .with_channel_capacity(0)
            .validate()
            .is_err());
    }
}
