//! Payload framing for WRITE and GET transfers.
//!
//! Two framings are supported and both peers must agree on one:
//!
//! - `length-prefixed` (default): every frame is a 4-byte big-endian length
//!   followed by that many bytes. A zero-length frame ends the stream, so any
//!   file content round-trips exactly.
//! - `sentinel`: raw chunks terminated by `DONE\n`. This is what reference
//!   peers speak. The receiver holds back the last five buffered bytes and
//!   ends the stream at a read of exactly `DONE\n`, or at end of stream when
//!   the held bytes are `DONE\n`. Senders half-close after the marker. File
//!   content that a single read delivers as exactly `DONE\n` still ends the
//!   stream early.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{TransferError, TransferResult};
use crate::protocol::session::Session;

/// End-of-stream marker of the sentinel framing.
pub const SENTINEL: &[u8] = b"DONE\n";

/// Default payload chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Largest frame a receiver accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Payload framing scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    LengthPrefixed,
    Sentinel,
}

/// A received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    End,
}

/// Send one data frame. Empty chunks are skipped since a zero-length frame
/// would end the stream.
pub async fn send_frame<S>(session: &mut Session<S>, framing: Framing, data: &[u8]) -> TransferResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(());
    }
    match framing {
        Framing::LengthPrefixed => {
            let mut frame = BytesMut::with_capacity(HEADER_LEN + data.len());
            frame.put_u32(data.len() as u32);
            frame.extend_from_slice(data);
            session.send(&frame).await
        }
        Framing::Sentinel => session.send(data).await,
    }
}

/// Send the end-of-stream marker.
pub async fn send_end<S>(session: &mut Session<S>, framing: Framing) -> TransferResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framing {
        Framing::LengthPrefixed => session.send(&[0u8; HEADER_LEN]).await,
        Framing::Sentinel => session.send(SENTINEL).await,
    }
}

/// Receive one frame. `None` means the stream closed without an end marker.
pub async fn recv_frame<S>(
    session: &mut Session<S>,
    framing: Framing,
    chunk_size: usize,
) -> TransferResult<Option<Frame>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framing {
        Framing::LengthPrefixed => {
            let Some(header) = session.read_exact(HEADER_LEN).await? else {
                return Ok(None);
            };
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if len == 0 {
                return Ok(Some(Frame::End));
            }
            if len > MAX_FRAME_LEN {
                return Err(TransferError::ProtocolViolation(format!(
                    "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
                )));
            }
            match session.read_exact(len).await? {
                Some(data) => Ok(Some(Frame::Data(data))),
                None => Err(TransferError::ProtocolViolation(
                    "stream ended after frame header".to_string(),
                )),
            }
        }
        Framing::Sentinel => recv_sentinel_frame(session, chunk_size).await,
    }
}

async fn recv_sentinel_frame<S>(
    session: &mut Session<S>,
    chunk_size: usize,
) -> TransferResult<Option<Frame>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let marker = SENTINEL.len();

    loop {
        if session.take_pending_end() {
            return Ok(Some(Frame::End));
        }

        // Never hand out bytes that may turn out to be the marker
        let buffered = session.buffered();
        if buffered > marker {
            let n = (buffered - marker).min(chunk_size.max(1));
            return Ok(Some(Frame::Data(session.take(n))));
        }

        let n = session.read_more().await?;
        if n == 0 {
            let len = session.buffered();
            let rest = session.take(len);
            if rest.is_empty() {
                return Ok(None);
            }
            if &rest[..] == SENTINEL {
                return Ok(Some(Frame::End));
            }
            return Ok(Some(Frame::Data(rest)));
        }

        // A read of exactly the marker ends the stream
        if n == marker && session.peek().ends_with(SENTINEL) {
            let held = session.buffered() - marker;
            if held == 0 {
                session.take(marker);
                return Ok(Some(Frame::End));
            }
            let data = session.take(held);
            session.take(marker);
            session.set_pending_end();
            return Ok(Some(Frame::Data(data)));
        }
    }
}

/// Stream `source` to the peer in `chunk_size` frames, then the end marker.
/// Returns the number of payload bytes sent.
pub async fn send_payload<S, R>(
    session: &mut Session<S>,
    framing: Framing,
    source: &mut R,
    source_path: &Path,
    chunk_size: usize,
) -> TransferResult<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total: u64 = 0;

    loop {
        let n = source
            .read(&mut buf)
            .await
            .map_err(|e| TransferError::resource(source_path, e))?;
        if n == 0 {
            break;
        }
        send_frame(session, framing, &buf[..n]).await?;
        total += n as u64;
        trace!(total, "sent");
    }

    send_end(session, framing).await?;
    Ok(total)
}

/// Receive frames into `sink` until the end marker. Returns the number of
/// payload bytes written. A stream that closes early is a protocol violation.
pub async fn recv_payload<S, W>(
    session: &mut Session<S>,
    framing: Framing,
    sink: &mut W,
    sink_path: &Path,
    chunk_size: usize,
) -> TransferResult<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total: u64 = 0;

    loop {
        match recv_frame(session, framing, chunk_size).await? {
            Some(Frame::Data(data)) => {
                sink.write_all(&data)
                    .await
                    .map_err(|e| TransferError::resource(sink_path, e))?;
                total += data.len() as u64;
                trace!(total, "received");
            }
            Some(Frame::End) => break,
            None => {
                return Err(TransferError::ProtocolViolation(format!(
                    "stream ended after {total} bytes without end-of-stream marker"
                )))
            }
        }
    }

    sink.flush()
        .await
        .map_err(|e| TransferError::resource(sink_path, e))?;
    Ok(total)
}
