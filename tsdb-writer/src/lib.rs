//! # tsdb-writer - Reliable asynchronous write path for time-series clients
//!
//! `tsdb-writer` accepts a continuous stream of line protocol records, groups
//! them into batches, and hands each batch to a transport you supply. When a
//! write fails with a retryable error, the batch is parked in a bounded,
//! time-ordered retry buffer and sent again with exponential backoff until it
//! is delivered, expires, or runs out of attempts.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tsdb_writer::prelude::*;
//!
//! # async fn example() -> WriteResult<()> {
//! let transport = transport_fn(|lines: bytes::Bytes| async move {
//!     // POST `lines` to the database's write endpoint
//!     let _ = lines;
//!     Ok(())
//! });
//!
//! let writer = PointsWriter::new(
//!     transport,
//!     WriteOptions::new()
//!         .with_batch_size(1_000)
//!         .with_flush_interval(Duration::from_secs(1)),
//! )?;
//!
//! writer.write("cpu,host=server01 usage=0.64 1700000000000000000").await;
//! writer.write_points(["mem,host=server01 used=512i"]).await;
//!
//! writer.flush().await;
//! writer.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery Model
//!
//! - Writes never fail synchronously. Failed attempts, expired batches and
//!   encoding errors are reported through the `on_write_failed` callback;
//!   batches evicted from a full retry buffer through `on_retry_skipped`.
//! - Batches are sent in the order they are produced as long as nothing is
//!   being retried. Retried batches re-enter the pipeline when their backoff
//!   elapses and may overtake or be overtaken by fresh batches.
//! - Everything is held in memory. `close` does not flush; call `flush`
//!   first if buffered lines must go out.
//!
//! ## Architecture
//!
//! - **`write_buffer`**: accumulates lines into count/size-bounded batches
//! - **`writer`**: `PointsWriter`, its buffering and sending loops
//! - **`retry`**: backoff strategy and the bounded retry buffer
//! - **`transport`**: the seam to the actual network client
//! - **`config`**: `WriteOptions`
//! - **`logging`**: optional subscriber setup

pub mod batch;
pub mod config;
pub mod error;
pub mod lines;
pub mod logging;
pub mod prelude;
pub mod retry;
pub mod transport;
pub mod write_buffer;
pub mod writer;

pub use error::{WriteError, WriteResult};
