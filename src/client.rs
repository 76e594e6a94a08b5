//! Client command drivers.
//!
//! Each driver runs the client half of one exchange over an established
//! connection. Local file handles are owned by the driver and released on
//! every exit path; a download that fails part-way leaves no partial file.

use bytes::Bytes;
use std::fmt;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::{ClientCommand, ClientConfig, TransferConfig};
use crate::error::{TransferError, TransferResult};
use crate::protocol::framing;
use crate::protocol::parser::{Command, Permission, Response};
use crate::protocol::session::{with_deadline, Session};
use crate::storage::{self, PartFile};

/// Mode for local directories created by GET
pub const LOCAL_DIR_MODE: u32 = 0o700;

/// Result of a completed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Upload finished. `ack` is empty if the server closed without one.
    Written { bytes: u64, ack: String },
    /// Download finished.
    Downloaded { bytes: u64 },
    /// Server confirmed the deletion.
    Removed { response: String },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Written { ack, .. } if ack.is_empty() => {
                write!(f, "Server closed the connection")
            }
            Outcome::Written { ack, .. } => f.write_str(ack),
            Outcome::Downloaded { bytes } => write!(f, "Received {bytes} bytes"),
            Outcome::Removed { response } => f.write_str(response),
        }
    }
}

/// Connect to the server and run one operation.
pub async fn run(config: &ClientConfig, command: ClientCommand) -> TransferResult<Outcome> {
    let stream = connect(&config.server, config.transfer).await?;
    let transfer = config.transfer;

    match command {
        ClientCommand::Write {
            local,
            remote,
            permission,
        } => write(stream, transfer, &local, &remote, permission).await,
        ClientCommand::Get { remote, local } => get(stream, transfer, &remote, &local).await,
        ClientCommand::Rm { remote } => rm(stream, transfer, &remote).await,
    }
}

/// Open a connection, bounded by the I/O deadline.
pub async fn connect(addr: &str, transfer: TransferConfig) -> TransferResult<TcpStream> {
    let stream = with_deadline(transfer.io_timeout, TcpStream::connect(addr)).await?;
    // Keep the end-of-stream marker in its own segment
    stream.set_nodelay(true)?;
    debug!(server = addr, "Connected");
    Ok(stream)
}

/// Upload `local` to `remote`.
pub async fn write<S>(
    stream: S,
    transfer: TransferConfig,
    local: &Path,
    remote: &str,
    permission: Permission,
) -> TransferResult<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut file = File::open(local)
        .await
        .map_err(|e| TransferError::resource(local, e))?;
    let meta = file
        .metadata()
        .await
        .map_err(|e| TransferError::resource(local, e))?;
    if !meta.is_file() {
        return Err(TransferError::resource(
            local,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        ));
    }

    let mut session = Session::new(stream, transfer.io_timeout);
    let command = Command::Write {
        local: local.display().to_string(),
        remote: remote.to_string(),
        permission,
    };
    info!(%command, "Sending command");
    session.send(command.encode().as_bytes()).await?;

    let response = session.read_line().await?;
    expect_ready(&response)?;

    let bytes =
        framing::send_payload(&mut session, transfer.framing, &mut file, local, transfer.chunk_size)
            .await?;
    info!(bytes, "Sent payload and end-of-stream marker");
    drop(file);
    // The server may be waiting for end of stream to confirm the marker
    session.shutdown().await?;

    let ack = response_text(&session.read_line().await?);
    if ack.is_empty() {
        info!("Server closed the connection");
    } else if ack.starts_with("ERROR") {
        return Err(TransferError::Rejected(ack));
    } else {
        info!(response = %ack, "Server response");
    }
    Ok(Outcome::Written { bytes, ack })
}

/// Download `remote` into `local`, creating missing parent directories.
///
/// Nothing is created locally unless the server answers `READY`.
pub async fn get<S>(
    stream: S,
    transfer: TransferConfig,
    remote: &str,
    local: &Path,
) -> TransferResult<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::new(stream, transfer.io_timeout);
    let command = Command::Get {
        remote: remote.to_string(),
        local: local.display().to_string(),
    };
    info!(%command, "Sending command");
    session.send(command.encode().as_bytes()).await?;

    let response = session.read_line().await?;
    expect_ready(&response)?;

    if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
        storage::create_dirs(parent, LOCAL_DIR_MODE)
            .await
            .map_err(|e| TransferError::resource(parent, e))?;
    }
    let part = PartFile::beside(local);
    let mut file = File::create(&part.path)
        .await
        .map_err(|e| TransferError::resource(&part.path, e))?;

    let bytes = framing::recv_payload(
        &mut session,
        transfer.framing,
        &mut file,
        &part.path,
        transfer.chunk_size,
    )
    .await?;
    drop(file);
    part.commit(local)
        .await
        .map_err(|e| TransferError::resource(local, e))?;

    info!(bytes, path = %local.display(), "Download complete");
    Ok(Outcome::Downloaded { bytes })
}

/// Delete `remote`.
pub async fn rm<S>(stream: S, transfer: TransferConfig, remote: &str) -> TransferResult<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::new(stream, transfer.io_timeout);
    let command = Command::Rm {
        remote: remote.to_string(),
    };
    info!(%command, "Sending command");
    session.send(command.encode().as_bytes()).await?;

    let response = session.read_line().await?;
    let text = response_text(&response);
    if response.starts_with(b"SUCCESS") {
        info!(response = %text, "Server response");
        Ok(Outcome::Removed { response: text })
    } else {
        Err(refusal(text))
    }
}

/// Check the ready handshake. Anything else aborts the exchange.
fn expect_ready(response: &Bytes) -> TransferResult<()> {
    if Response::is_ready(response) {
        debug!("Server ready");
        return Ok(());
    }
    Err(refusal(response_text(response)))
}

fn refusal(text: String) -> TransferError {
    if text.is_empty() {
        TransferError::ProtocolViolation("connection closed without a response".to_string())
    } else if text.starts_with("ERROR") || text.starts_with("Invalid command format") {
        TransferError::Rejected(text)
    } else {
        TransferError::ProtocolViolation(format!("unexpected response: {text}"))
    }
}

fn response_text(line: &[u8]) -> String {
    String::from_utf8_lossy(line).trim_end().to_string()
}
