use bytes::Bytes;
use tracing::debug;

use crate::lines::lines_count;

/// Accumulates line bytes into batches bounded by line count and byte size.
///
/// Owned by the buffering loop alone, so it needs no locking. Every flush
/// hands back the accumulated bytes and resets the buffer to empty.
#[derive(Debug)]
pub struct WriteBuffer {
    buffer: Vec<u8>,
    line_count: usize,
    max_length: usize,
    max_bytes: usize,
}

/// Batches emitted by a single [`WriteBuffer::add`] call, oldest first.
#[derive(Debug, Default)]
pub struct Flushed {
    before: Option<Bytes>,
    after: Option<Bytes>,
}

impl Iterator for Flushed {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        self.before.take().or_else(|| self.after.take())
    }
}

impl WriteBuffer {
    /// Create a buffer that flushes at `max_length` lines or `max_bytes` bytes.
    pub fn new(max_length: usize, max_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            line_count: 0,
            max_length,
            max_bytes,
        }
    }

    /// Append `line` and return any batches that became ready.
    ///
    /// If the line would push the buffer past `max_bytes`, the current
    /// contents are flushed before it is appended. Reaching `max_length`
    /// lines flushes again after appending. A line that alone exceeds
    /// `max_bytes` is emitted as a batch of its own.
    pub fn add(&mut self, line: &[u8]) -> Flushed {
        if line.is_empty() {
            return Flushed::default();
        }

        let needs_newline = !line.ends_with(b"\n");
        let incoming = line.len() + usize::from(needs_newline);

        let mut flushed = Flushed::default();
        if self.buffer.len() + incoming > self.max_bytes {
            flushed.before = self.flush();
        }

        self.buffer.extend_from_slice(line);
        if needs_newline {
            self.buffer.push(b'\n');
        }
        self.line_count += lines_count(line);

        if self.line_count >= self.max_length || self.buffer.len() > self.max_bytes {
            flushed.after = self.flush();
        }
        flushed
    }

    /// Take the accumulated bytes, leaving the buffer empty.
    ///
    /// Returns `None` when there is nothing to flush.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }

        debug!(
            lines = self.line_count,
            bytes = self.buffer.len(),
            "Flushing write buffer"
        );
        self.line_count = 0;
        Some(Bytes::from(std::mem::take(&mut self.buffer)))
    }

    /// Number of lines currently buffered.
    pub fn len(&self) -> usize {
        self.line_count
    }

    /// Number of bytes currently buffered.
    pub fn byte_len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
