//! Newline-delimited text framing over any async byte stream.
//!
//! The server and the client both speak plain UTF-8 lines, so the framing is
//! just "bytes up to `\n`". Readers cap the length of a single line so one
//! peer cannot make the process buffer an unbounded amount of memory.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default cap on a single line, excluding the terminator.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection closed unexpectedly")]
    ConnectionClosed,
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("i/o timed out")]
    TimedOut,
    #[error(transparent)]
    Io(io::Error),
}

impl TransportError {
    /// True for errors caused by what the peer sent rather than by the socket.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::LineTooLong { .. } | Self::InvalidUtf8)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionReset,
            io::ErrorKind::UnexpectedEof => Self::ConnectionClosed,
            io::ErrorKind::TimedOut => Self::TimedOut,
            io::ErrorKind::InvalidData => Self::InvalidUtf8,
            _ => Self::Io(err),
        }
    }
}

/// Reading half of a line transport.
pub struct LineReader<R> {
    inner: R,
    max_line_bytes: usize,
    buf: Vec<u8>,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self::with_max_line_bytes(inner, DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(inner: R, max_line_bytes: usize) -> Self {
        Self {
            inner,
            max_line_bytes,
            buf: Vec::new(),
        }
    }

    /// Reads the next line with its terminator stripped.
    ///
    /// Returns `Ok(None)` once the peer has closed its side. A final line
    /// without a trailing `\n` is still returned before end of stream.
    pub async fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        self.buf.clear();

        // Allow room for "\r\n" so a line of exactly `max_line_bytes` is accepted.
        let limit = self.max_line_bytes as u64 + 2;
        let bytes = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }

        let terminated = self.buf.last() == Some(&b'\n');
        if !terminated && bytes as u64 == limit {
            return Err(TransportError::LineTooLong {
                limit: self.max_line_bytes,
            });
        }

        if terminated {
            self.buf.pop();
        }
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        if self.buf.len() > self.max_line_bytes {
            return Err(TransportError::LineTooLong {
                limit: self.max_line_bytes,
            });
        }

        let line = std::str::from_utf8(&self.buf).map_err(|_| TransportError::InvalidUtf8)?;
        Ok(Some(line.to_owned()))
    }
}

/// Writing half of a line transport.
pub struct LineWriter<W> {
    inner: W,
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes `line` followed by `\n` and flushes so the peer sees it promptly.
    pub async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut encoded = Vec::with_capacity(line.len() + 1);
        encoded.extend_from_slice(line.as_bytes());
        encoded.push(b'\n');
        self.inner.write_all(&encoded).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Half-closes the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
