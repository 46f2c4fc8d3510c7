use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::WriteResult;

/// Delivers a batch of line bytes to the database.
///
/// The writer calls this once per attempt and may call it again with
/// identical bytes after a failure. Timeouts, authentication and compression
/// belong to the implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one batch.
    ///
    /// # Errors
    ///
    /// Return [`WriteError::Server`](crate::WriteError::Server) with the
    /// response status for rejected writes so that retryable failures can
    /// be recognised.
    async fn write(&self, lines: Bytes) -> WriteResult<()>;
}

/// Adapts an async closure into a [`Transport`].
pub struct FnTransport<F> {
    send: F,
}

/// Build a [`Transport`] from a closure returning a future.
///
/// ```rust
/// use tsdb_writer::transport::transport_fn;
///
/// let transport = transport_fn(|lines: bytes::Bytes| async move {
///     println!("sending {} bytes", lines.len());
///     Ok(())
/// });
/// # let _ = transport;
/// ```
pub fn transport_fn<F, Fut>(send: F) -> FnTransport<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = WriteResult<()>> + Send + 'static,
{
    FnTransport { send }
}

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = WriteResult<()>> + Send + 'static,
{
    async fn write(&self, lines: Bytes) -> WriteResult<()> {
        (self.send)(lines).await
    }
}
