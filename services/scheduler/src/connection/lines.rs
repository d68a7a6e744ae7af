//! Newline framing over a chunked response body.

use std::fmt::Display;

use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

use super::ConnectionError;

/// Largest event line accepted. Offer batches on big clusters run to a few
/// hundred kilobytes.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Splits a byte stream into raw lines, stripping `\n` and a trailing `\r`.
///
/// Lines are handed out as bytes; whether they are valid text is the
/// decoder's business.
pub struct LineReader<S> {
    stream: S,
    buf: BytesMut,
    /// Prefix of `buf` already searched for a newline.
    scanned: usize,
    max_line: usize,
    eof: bool,
}

impl<S, E> LineReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    pub fn new(stream: S) -> Self {
        Self::with_max_line(stream, MAX_LINE_BYTES)
    }

    pub fn with_max_line(stream: S, max_line: usize) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
            scanned: 0,
            max_line,
            eof: false,
        }
    }

    /// Next line, or `None` once the stream has ended and the buffer is
    /// drained.
    pub async fn next_line(&mut self) -> Result<Option<Bytes>, ConnectionError> {
        loop {
            if let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
                let pos = self.scanned + offset;
                self.scanned = 0;
                let line = self.buf.split_to(pos);
                self.buf.advance(1);
                return self.finish(line).map(Some);
            }
            self.scanned = self.buf.len();

            // One extra byte for a `\r` still waiting on its `\n`.
            if self.buf.len() > self.max_line.saturating_add(1) {
                return Err(ConnectionError::LineTooLong(self.max_line));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                self.scanned = 0;
                let rest = self.buf.split();
                return self.finish(rest).map(Some);
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(ConnectionError::Read(e.to_string())),
                None => self.eof = true,
            }
        }
    }

    fn finish(&self, mut line: BytesMut) -> Result<Bytes, ConnectionError> {
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        if line.len() > self.max_line {
            return Err(ConnectionError::LineTooLong(self.max_line));
        }
        Ok(line.freeze())
    }
}
