//! PointsWriter - asynchronous, retrying write path.
//!
//! Lines written through [`PointsWriter`] are grouped into batches by a
//! buffering loop and delivered by a sending loop through the configured
//! [`Transport`]. Failed batches wait in a [`RetryBuffer`] and re-enter the
//! sending loop when their backoff elapses.
//!
//! ```text
//! write() ──▶ [lines] ──▶ buffering loop ──▶ [batches] ──▶ sending loop ──▶ Transport
//!                          (WriteBuffer)                   ▲         │
//!                                                          │         │ retryable failure
//!                                                  [retries]         ▼
//!                                                          └── RetryBuffer (timer)
//! ```
//!
//! Failures never surface from `write`; they are reported through the
//! callbacks registered on [`PointsWriterBuilder`] and through `tracing`.
//!
//! # Example
//!
//! ```rust,no_run
//! use tsdb_writer::prelude::*;
//!
//! # async fn example() -> WriteResult<()> {
//! let transport = transport_fn(|lines: bytes::Bytes| async move {
//!     // hand `lines` to an HTTP client here
//!     let _ = lines;
//!     Ok(())
//! });
//!
//! let writer = PointsWriter::builder(transport)
//!     .options(WriteOptions::new().with_batch_size(500))
//!     .on_write_failed(|err, _lines, attempt, _expires| {
//!         eprintln!("attempt {attempt} failed: {err}");
//!         err.is_retryable()
//!     })
//!     .build()?;
//!
//! writer.write("cpu,host=a usage=0.5").await;
//! writer.flush().await;
//! let stats = writer.close().await;
//! println!("sent {} batches", stats.batches_sent);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::batch::Batch;
use crate::config::WriteOptions;
use crate::error::{WriteError, WriteResult};
use crate::lines::{lines_count, LineEncoder, ToLineProtocol};
use crate::logging::truncate_field;
use crate::retry::{ExponentialRetry, RetryBuffer, RetrySkippedCallback, RetryStrategy};
use crate::transport::Transport;
use crate::write_buffer::WriteBuffer;

/// Invoked with `(error, lines, attempt, expires)` on every failed attempt.
///
/// Returning `true` asks for a retry, `false` drops the batch; this replaces
/// the default classification of [`WriteError::is_retryable`]. Encoding
/// failures are reported with `attempt == 0`, empty lines and no expiry;
/// their return value is ignored.
pub type WriteFailedCallback =
    Arc<dyn Fn(&WriteError, &Bytes, u32, Option<Instant>) -> bool + Send + Sync>;

/// Counters describing what a writer has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub batches_expired: u64,
    pub retries_scheduled: u64,
    pub lines_skipped: u64,
    pub encoding_failures: u64,
    /// Lines left in the retry buffer when the writer was closed.
    pub retry_buffer_residual: usize,
}

#[derive(Debug, Default)]
struct Counters {
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    batches_expired: AtomicU64,
    retries_scheduled: AtomicU64,
    lines_skipped: AtomicU64,
    encoding_failures: AtomicU64,
}

impl Counters {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WriterStats {
        WriterStats {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_expired: self.batches_expired.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            lines_skipped: self.lines_skipped.load(Ordering::Relaxed),
            encoding_failures: self.encoding_failures.load(Ordering::Relaxed),
            retry_buffer_residual: 0,
        }
    }
}

enum Command {
    Flush(oneshot::Sender<()>),
}

enum SendItem {
    Batch(Batch),
    /// Acknowledged once every item queued before it has been handled.
    Barrier(oneshot::Sender<()>),
}

/// Builder for [`PointsWriter`].
pub struct PointsWriterBuilder {
    transport: Arc<dyn Transport>,
    options: WriteOptions,
    on_write_failed: Option<WriteFailedCallback>,
    on_retry_skipped: Option<RetrySkippedCallback>,
    retry_strategy: Option<Box<dyn RetryStrategy>>,
}

impl PointsWriterBuilder {
    /// Set the batching and retry options.
    pub fn options(mut self, options: WriteOptions) -> Self {
        self.options = options;
        self
    }

    /// Register the failed-write callback.
    pub fn on_write_failed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&WriteError, &Bytes, u32, Option<Instant>) -> bool + Send + Sync + 'static,
    {
        self.on_write_failed = Some(Arc::new(callback));
        self
    }

    /// Register the callback for batches evicted from the retry buffer.
    pub fn on_retry_skipped<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Bytes, u32, Instant) + Send + Sync + 'static,
    {
        self.on_retry_skipped = Some(Arc::new(callback));
        self
    }

    /// Replace the default [`ExponentialRetry`] strategy.
    pub fn retry_strategy(mut self, strategy: impl RetryStrategy + 'static) -> Self {
        self.retry_strategy = Some(Box::new(strategy));
        self
    }

    /// Validate the options and start the writer's background loops.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Configuration`] if the options are invalid.
    #[instrument(skip(self), fields(batch_size = self.options.batch_size()))]
    pub fn build(self) -> WriteResult<PointsWriter> {
        self.options.validate()?;

        let options = Arc::new(self.options);
        let counters = Arc::new(Counters::default());
        let capacity = options.channel_capacity();

        let (line_tx, line_rx) = mpsc::channel(capacity);
        let (command_tx, command_rx) = mpsc::channel(1);
        let (batch_tx, batch_rx) = mpsc::channel(capacity);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let skipped_counters = Arc::clone(&counters);
        let user_skipped = self.on_retry_skipped;
        let on_remove: RetrySkippedCallback =
            Arc::new(move |lines: &Bytes, retries: u32, expires: Instant| {
                skipped_counters
                    .lines_skipped
                    .fetch_add(lines_count(lines) as u64, Ordering::Relaxed);
                if let Some(callback) = &user_skipped {
                    callback(lines, retries, expires);
                }
            });
        let retry_buffer =
            RetryBuffer::new(options.retry_buffer_limit(), retry_tx, Some(on_remove));

        let strategy = self.retry_strategy.unwrap_or_else(|| {
            Box::new(ExponentialRetry::from_options(&options)) as Box<dyn RetryStrategy>
        });

        let buffering = BufferingLoop {
            buffer: WriteBuffer::new(options.batch_size(), options.max_batch_bytes()),
            line_rx,
            command_rx,
            batch_tx,
            shutdown: shutdown_rx.clone(),
            options: Arc::clone(&options),
        };
        let sending = SendingLoop {
            transport: self.transport,
            batch_rx,
            retry_rx,
            retry_buffer: retry_buffer.clone(),
            strategy,
            on_write_failed: self.on_write_failed.clone(),
            max_retries: options.max_retries(),
            counters: Arc::clone(&counters),
            shutdown: shutdown_rx,
        };

        let buffering_handle = tokio::spawn(buffering.run());
        let sending_handle = tokio::spawn(sending.run());

        info!(
            flush_interval_ms = options.flush_interval().as_millis() as u64,
            max_retries = options.max_retries(),
            "Points writer started"
        );

        Ok(PointsWriter {
            options,
            line_tx,
            command_tx,
            shutdown_tx,
            retry_buffer,
            on_write_failed: self.on_write_failed,
            counters,
            handles: Mutex::new(Some((buffering_handle, sending_handle))),
        })
    }
}

/// Non-blocking, batching writer with retry.
///
/// `write` calls only wait when the pipeline is saturated. Call
/// [`close`](Self::close) to stop the background loops; anything still
/// buffered at that point is discarded, so call [`flush`](Self::flush) first
/// if it must be sent.
pub struct PointsWriter {
    options: Arc<WriteOptions>,
    line_tx: mpsc::Sender<Bytes>,
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: watch::Sender<bool>,
    retry_buffer: RetryBuffer,
    on_write_failed: Option<WriteFailedCallback>,
    counters: Arc<Counters>,
    handles: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl PointsWriter {
    /// Start a builder for a writer sending through `transport`.
    pub fn builder(transport: impl Transport + 'static) -> PointsWriterBuilder {
        PointsWriterBuilder {
            transport: Arc::new(transport),
            options: WriteOptions::default(),
            on_write_failed: None,
            on_retry_skipped: None,
            retry_strategy: None,
        }
    }

    /// Create a writer with the given options and no callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Configuration`] if the options are invalid.
    pub fn new(transport: impl Transport + 'static, options: WriteOptions) -> WriteResult<Self> {
        Self::builder(transport).options(options).build()
    }

    /// Queue raw line bytes. Empty input is ignored.
    ///
    /// Waits while the buffering loop is busy.
    pub async fn write(&self, line: impl Into<Bytes>) {
        let line = line.into();
        if line.is_empty() {
            return;
        }
        if self.is_closed() {
            warn!("Write called on a closed writer, discarding line");
            return;
        }
        if self.line_tx.send(line).await.is_err() {
            debug!("Buffering loop has stopped, discarding line");
        }
    }

    /// Encode and queue records.
    ///
    /// A record that fails to encode is reported and skipped; the rest are
    /// still written.
    pub async fn write_points<I>(&self, points: I)
    where
        I: IntoIterator,
        I::Item: ToLineProtocol,
    {
        for point in points {
            let mut line = Vec::new();
            match point.write_line(&mut line) {
                Ok(()) => self.write(line).await,
                Err(err) => self.report_encoding_failure(&err),
            }
        }
    }

    /// Encode `records` with `encoder` and queue them.
    ///
    /// Encoding failures are handled as in [`write_points`](Self::write_points).
    pub async fn write_data<T, E>(&self, encoder: &E, records: &[T])
    where
        T: Sync,
        E: LineEncoder<T> + ?Sized,
    {
        for record in records {
            let mut line = Vec::new();
            match encoder.encode(record, &mut line) {
                Ok(()) => self.write(line).await,
                Err(err) => self.report_encoding_failure(&err),
            }
        }
    }

    /// Push all known work to the transport.
    ///
    /// Releases every batch waiting in the retry buffer, flushes the write
    /// buffer, and waits until the sending loop has taken everything queued
    /// so far. Delivery failures are still only reported via callbacks.
    #[instrument(skip(self))]
    pub async fn flush(&self) {
        if self.is_closed() {
            return;
        }

        let released = self.retry_buffer.flush().await;
        debug!(released, "Flushing writer");

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.command_tx.send(Command::Flush(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    /// Stop both loops and the retry timer.
    ///
    /// Does not flush: lines still in the write buffer or the retry buffer
    /// are dropped. Returns the final statistics; calling it again only
    /// returns a fresh snapshot.
    #[instrument(skip(self))]
    pub async fn close(&self) -> WriterStats {
        let residual = self.retry_buffer.close().await;
        self.shutdown_tx.send_replace(true);

        if let Some((buffering, sending)) = self.handles.lock().await.take() {
            if let Err(e) = buffering.await {
                error!(error = %e, "Buffering loop terminated abnormally");
            }
            if let Err(e) = sending.await {
                error!(error = %e, "Sending loop terminated abnormally");
            }
        }

        let mut stats = self.counters.snapshot();
        stats.retry_buffer_residual = residual;
        if residual > 0 {
            warn!(lines = residual, "Closing writer with lines awaiting retry");
        }
        info!(
            sent = stats.batches_sent,
            failed = stats.batches_failed,
            expired = stats.batches_expired,
            retries = stats.retries_scheduled,
            "Points writer stopped"
        );
        stats
    }

    /// Current statistics.
    pub fn stats(&self) -> WriterStats {
        self.counters.snapshot()
    }

    /// Number of lines waiting in the retry buffer.
    pub async fn retry_buffer_len(&self) -> usize {
        self.retry_buffer.len().await
    }

    /// Check if [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Get the writer options.
    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    fn report_encoding_failure(&self, err: &WriteError) {
        Counters::incr(&self.counters.encoding_failures);
        warn!(error = %err, "Failed to encode record, skipping it");
        if let Some(callback) = &self.on_write_failed {
            callback(err, &Bytes::new(), 0, None);
        }
    }
}

impl Drop for PointsWriter {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

struct BufferingLoop {
    buffer: WriteBuffer,
    line_rx: mpsc::Receiver<Bytes>,
    command_rx: mpsc::Receiver<Command>,
    batch_tx: mpsc::Sender<SendItem>,
    shutdown: watch::Receiver<bool>,
    options: Arc<WriteOptions>,
}

impl BufferingLoop {
    #[instrument(name = "buffering_loop", skip(self))]
    async fn run(mut self) {
        let flush_interval = self.options.flush_interval();
        let timer = tokio::time::sleep(flush_interval);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                line = self.line_rx.recv() => {
                    let Some(line) = line else { break };
                    if !self.add(&line).await {
                        break;
                    }
                }
                () = &mut timer => {
                    if !self.flush().await {
                        break;
                    }
                    timer.as_mut().reset(Instant::now() + flush_interval);
                }
                Some(command) = self.command_rx.recv() => {
                    let Command::Flush(ack) = command;
                    if !self.flush().await || !self.forward(SendItem::Barrier(ack)).await {
                        break;
                    }
                    timer.as_mut().reset(Instant::now() + flush_interval);
                }
            }
        }

        if !self.buffer.is_empty() {
            debug!(
                lines = self.buffer.len(),
                "Discarding buffered lines on shutdown"
            );
        }
        debug!("Buffering loop stopped");
    }

    async fn add(&mut self, line: &[u8]) -> bool {
        for lines in self.buffer.add(line) {
            if !self.emit(lines).await {
                return false;
            }
        }
        true
    }

    async fn flush(&mut self) -> bool {
        match self.buffer.flush() {
            Some(lines) => self.emit(lines).await,
            None => true,
        }
    }

    async fn emit(&mut self, lines: Bytes) -> bool {
        let batch = Batch::new(
            lines,
            self.options.max_retries(),
            self.options.max_retry_time(),
        );
        self.forward(SendItem::Batch(batch)).await
    }

    /// Hand an item to the sending loop; false once the writer is shutting down.
    async fn forward(&mut self, item: SendItem) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => false,
            sent = self.batch_tx.send(item) => sent.is_ok(),
        }
    }
}

struct SendingLoop {
    transport: Arc<dyn Transport>,
    batch_rx: mpsc::Receiver<SendItem>,
    retry_rx: mpsc::UnboundedReceiver<Batch>,
    retry_buffer: RetryBuffer,
    strategy: Box<dyn RetryStrategy>,
    on_write_failed: Option<WriteFailedCallback>,
    max_retries: u32,
    counters: Arc<Counters>,
    shutdown: watch::Receiver<bool>,
}

impl SendingLoop {
    #[instrument(name = "sending_loop", skip(self))]
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                Some(batch) = self.retry_rx.recv() => self.send(batch).await,
                item = self.batch_rx.recv() => match item {
                    Some(SendItem::Batch(batch)) => self.send(batch).await,
                    Some(SendItem::Barrier(ack)) => {
                        let _ = ack.send(());
                    }
                    None => break,
                },
            }
        }

        self.retry_buffer.close().await;
        debug!("Sending loop stopped");
    }

    async fn send(&mut self, batch: Batch) {
        let attempt = self
            .max_retries
            .saturating_sub(batch.remaining_attempts)
            .saturating_add(1);

        if batch.is_expired(Instant::now()) {
            Counters::incr(&self.counters.batches_expired);
            let err = WriteError::MaxRetryTimeExceeded;
            warn!(
                lines = lines_count(&batch.lines),
                attempt, "Dropping batch: {err}"
            );
            if let Some(callback) = &self.on_write_failed {
                callback(&err, &batch.lines, attempt, Some(batch.expires_at));
            }
            return;
        }

        match self.transport.write(batch.lines.clone()).await {
            Ok(()) => {
                self.strategy.success();
                Counters::incr(&self.counters.batches_sent);
                debug!(bytes = batch.lines.len(), attempt, "Batch written");
            }
            Err(err) => self.handle_failure(batch, err, attempt).await,
        }
    }

    async fn handle_failure(&mut self, batch: Batch, err: WriteError, attempt: u32) {
        let retry = match &self.on_write_failed {
            Some(callback) => callback(&err, &batch.lines, attempt, Some(batch.expires_at)),
            None => err.is_retryable(),
        };

        if retry && batch.remaining_attempts > 0 {
            let delay: Duration = self.strategy.next_delay(&err, attempt);
            warn!(
                error = %err,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Write failed, scheduling retry"
            );
            Counters::incr(&self.counters.retries_scheduled);
            self.retry_buffer
                .add_lines(
                    batch.lines,
                    batch.remaining_attempts - 1,
                    delay,
                    batch.expires_at,
                )
                .await;
        } else {
            Counters::incr(&self.counters.batches_failed);
            error!(
                error = %err,
                attempt,
                lines = lines_count(&batch.lines),
                preview = %truncate_field(&String::from_utf8_lossy(&batch.lines), 128),
                "Write failed permanently, dropping batch"
            );
        }
    }
}
