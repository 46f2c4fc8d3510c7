//! Retry scheduling for failed batches.
//!
//! [`RetryStrategy`] decides how long a failed batch waits; [`RetryBuffer`]
//! holds it until then and feeds it back into the sending loop.

mod buffer;
mod strategy;

pub use buffer::{RetryBuffer, RetryItem, RetrySkippedCallback};
pub use strategy::{ExponentialRetry, RetryStrategy};
