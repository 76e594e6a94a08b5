//! One connection, one command.
//!
//! A [`Session`] owns the byte stream and the read buffer for the lifetime of a
//! single protocol exchange. Bytes that arrive ahead of the state machine (for
//! example payload that follows `READY\n` in the same segment) stay buffered
//! until the next read.

use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{ParseError, TransferError, TransferResult};
use crate::protocol::parser::{find_newline, MAX_COMMAND_LENGTH};

/// Initial read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Byte stream plus parsing state for one exchange.
pub struct Session<S> {
    stream: S,
    buffer: BytesMut,
    timeout: Option<Duration>,
    /// An end marker was consumed while data ahead of it was still owed.
    pending_end: bool,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a connected stream. `timeout` bounds every individual read and
    /// write; `None` waits forever.
    pub fn new(stream: S, timeout: Option<Duration>) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            timeout,
            pending_end: false,
        }
    }

    /// Read the command line.
    ///
    /// Returns the line without its terminator once `\n` arrives. With
    /// `accept_unterminated`, whatever the first read delivered counts as the
    /// whole command, which is how reference clients send it. Returns `None`
    /// if the peer closed before sending anything.
    pub async fn read_command(&mut self, accept_unterminated: bool) -> TransferResult<Option<Bytes>> {
        loop {
            if let Some(pos) = find_newline(&self.buffer) {
                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                return Ok(Some(line.freeze()));
            }
            if self.buffer.len() > MAX_COMMAND_LENGTH {
                return Err(ParseError::TooLong.into());
            }
            if accept_unterminated && !self.buffer.is_empty() {
                return Ok(Some(self.buffer.split().freeze()));
            }

            let n = self.fill().await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.buffer.split().freeze()));
            }
        }
    }

    /// Read one response line including its `\n`.
    ///
    /// If the peer closes first, returns whatever arrived, which may be empty.
    pub async fn read_line(&mut self) -> TransferResult<Bytes> {
        loop {
            if let Some(pos) = find_newline(&self.buffer) {
                return Ok(self.buffer.split_to(pos + 1).freeze());
            }
            if self.buffer.len() > MAX_COMMAND_LENGTH {
                return Err(TransferError::ProtocolViolation(
                    "response line too long".to_string(),
                ));
            }
            if self.fill().await? == 0 {
                return Ok(self.buffer.split().freeze());
            }
        }
    }

    /// Return exactly `n` bytes, or `None` if the stream ends cleanly before
    /// any of them arrive.
    pub async fn read_exact(&mut self, n: usize) -> TransferResult<Option<Bytes>> {
        self.buffer.reserve(n.saturating_sub(self.buffer.len()));
        while self.buffer.len() < n {
            if self.fill().await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransferError::ProtocolViolation(format!(
                    "stream ended mid-frame ({} of {n} bytes)",
                    self.buffer.len()
                )));
            }
        }
        Ok(Some(self.buffer.split_to(n).freeze()))
    }

    /// Write all of `data` and flush.
    pub async fn send(&mut self, data: &[u8]) -> TransferResult<()> {
        trace!(len = data.len(), "send");
        let stream = &mut self.stream;
        with_deadline(self.timeout, async move {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await
    }

    /// Half-close the write side, signalling orderly end of session.
    pub async fn shutdown(&mut self) -> TransferResult<()> {
        with_deadline(self.timeout, self.stream.shutdown()).await
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn peek(&self) -> &[u8] {
        &self.buffer
    }

    /// Remove and return the first `n` buffered bytes.
    pub(crate) fn take(&mut self, n: usize) -> Bytes {
        self.buffer.split_to(n).freeze()
    }

    /// Perform one read into the buffer. Returns the number of bytes read,
    /// zero at end of stream.
    pub(crate) async fn read_more(&mut self) -> TransferResult<usize> {
        self.fill().await
    }

    pub(crate) fn set_pending_end(&mut self) {
        self.pending_end = true;
    }

    pub(crate) fn take_pending_end(&mut self) -> bool {
        std::mem::take(&mut self.pending_end)
    }

    async fn fill(&mut self) -> TransferResult<usize> {
        if self.buffer.capacity() == self.buffer.len() {
            self.buffer.reserve(BUFFER_SIZE);
        }
        let n = with_deadline(self.timeout, self.stream.read_buf(&mut self.buffer)).await?;
        trace!(n, "read");
        Ok(n)
    }
}

/// Run an I/O future under an optional deadline.
pub(crate) async fn with_deadline<F, T>(timeout: Option<Duration>, fut: F) -> TransferResult<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransferError::Timeout(limit)),
        },
        None => Ok(fut.await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_command_terminated() {
        let mock = Builder::new().read(b"RM a").read(b"bc\n").build();
        let mut session = Session::new(mock, None);
        let line = session.read_command(false).await.unwrap().unwrap();
        assert_eq!(&line[..], b"RM abc");
    }

    #[tokio::test]
    async fn test_read_command_unterminated_first_read() {
        let mock = Builder::new().read(b"WRITE a b").build();
        let mut session = Session::new(mock, None);
        let line = session.read_command(true).await.unwrap().unwrap();
        assert_eq!(&line[..], b"WRITE a b");
    }

    #[tokio::test]
    async fn test_read_command_eof() {
        let mock = Builder::new().build();
        let mut session = Session::new(mock, None);
        assert!(session.read_command(false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_line_keeps_trailing_bytes() {
        let mock = Builder::new().read(b"READY\nhello").build();
        let mut session = Session::new(mock, None);
        assert_eq!(&session.read_line().await.unwrap()[..], b"READY\n");
        assert_eq!(session.buffered(), 5);
        assert_eq!(session.peek(), b"hello");
        assert_eq!(&session.take(5)[..], b"hello");
        assert_eq!(session.read_more().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_line_empty_on_close() {
        let mock = Builder::new().build();
        let mut session = Session::new(mock, None);
        assert!(session.read_line().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_exact_across_reads() {
        let mock = Builder::new().read(b"\x00\x00").read(b"\x00\x05").build();
        let mut session = Session::new(mock, None);
        let header = session.read_exact(4).await.unwrap().unwrap();
        assert_eq!(&header[..], &[0, 0, 0, 5]);
    }

    #[tokio::test]
    async fn test_read_exact_truncated() {
        let mock = Builder::new().read(b"\x00\x00").build();
        let mut session = Session::new(mock, None);
        assert!(matches!(
            session.read_exact(4).await,
            Err(TransferError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_send_writes_bytes() {
        let mock = Builder::new().write(b"READY\n").build();
        let mut session = Session::new(mock, None);
        session.send(b"READY\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (client, _server) = tokio::io::duplex(64);
        let mut session = Session::new(client, Some(Duration::from_millis(20)));
        assert!(matches!(
            session.read_line().await,
            Err(TransferError::Timeout(_))
        ));
    }
}
