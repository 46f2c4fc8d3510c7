//! Prelude for commonly used types and traits in tsdb-writer.

pub use crate::config::WriteOptions;
pub use crate::error::{WriteError, WriteResult};
pub use crate::lines::{LineEncoder, ToLineProtocol};
pub use crate::retry::{ExponentialRetry, RetryStrategy};
pub use crate::transport::{transport_fn, Transport};
pub use crate::writer::{PointsWriter, PointsWriterBuilder, WriterStats};
