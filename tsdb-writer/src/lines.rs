//! Line protocol helpers shared by the buffering stage and the writer API.
//!
//! Encoding structured records is left to the caller: anything implementing
//! [`ToLineProtocol`] (or a [`LineEncoder`] for foreign types) can be written.

use bytes::Bytes;

use crate::error::WriteResult;

/// Count the newline-delimited records in `lines`.
///
/// A final record without a trailing newline is still counted.
pub fn lines_count(lines: &[u8]) -> usize {
    let newlines = lines.iter().filter(|&&b| b == b'\n').count();
    match lines.last() {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}

/// A record that can serialize itself as one line of line protocol.
pub trait ToLineProtocol {
    /// Append the encoded record, including its terminating newline, to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Encoding`](crate::WriteError::Encoding) when the
    /// record cannot be represented.
    fn write_line(&self, out: &mut Vec<u8>) -> WriteResult<()>;
}

/// Encodes values of a type the caller does not own.
pub trait LineEncoder<T: ?Sized>: Send + Sync {
    /// Append the encoded record, including its terminating newline, to `out`.
    fn encode(&self, record: &T, out: &mut Vec<u8>) -> WriteResult<()>;
}

impl<T: ToLineProtocol + ?Sized> ToLineProtocol for &T {
    fn write_line(&self, out: &mut Vec<u8>) -> WriteResult<()> {
        (**self).write_line(out)
    }
}

impl ToLineProtocol for [u8] {
    fn write_line(&self, out: &mut Vec<u8>) -> WriteResult<()> {
        out.extend_from_slice(self);
        if !self.is_empty() && !self.ends_with(b"\n") {
            out.push(b'\n');
        }
        Ok(())
    }
}

impl ToLineProtocol for Vec<u8> {
    fn write_line(&self, out: &mut Vec<u8>) -> WriteResult<()> {
        self.as_slice().write_line(out)
    }
}

impl ToLineProtocol for Bytes {
    fn write_line(&self, out: &mut Vec<u8>) -> WriteResult<()> {
        self.as_ref().write_line(out)
    }
}

impl ToLineProtocol for str {
    fn write_line(&self, out: &mut Vec<u8>) -> WriteResult<()> {
        self.as_bytes().write_line(out)
    }
}

impl ToLineProtocol for String {
    fn write_line(&self, out: &mut Vec<u8>) -> WriteResult<()> {
        self.as_bytes().write_line(out)
    }
}
