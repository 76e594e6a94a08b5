//! Error types shared by the server handlers and the client drivers.
//!
//! Every variant of [`TransferError`] is fatal to the session it occurred in.
//! Nothing is retried; the server keeps accepting new connections.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::parser::CommandKind;

/// Failure to decode a command line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Nothing but whitespace was received.
    #[error("empty command")]
    Empty,
    /// First token is not WRITE, GET or RM.
    #[error("unsupported command: {0}")]
    UnknownCommand(String),
    /// Wrong number of tokens for the keyword.
    #[error("invalid {0} command format")]
    InvalidFormat(CommandKind),
    /// WRITE permission token other than `-r` / `-rw`.
    #[error("invalid permission flag: {0} (expected -r or -rw)")]
    InvalidPermission(String),
    /// Command line exceeded the maximum line length.
    #[error("command line too long")]
    TooLong,
}

/// Failure to map a remote path onto the server file tree.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path must be relative: {0}")]
    Absolute(String),
    #[error("remote path escapes the server root: {0}")]
    EscapesRoot(String),
    #[error("I/O error preparing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Session-level failure.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Malformed command.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A local or remote file could not be opened, created or finalized.
    #[error("{path}: {source}")]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Remote path rejected by the resolver.
    #[error(transparent)]
    Path(#[from] PathError),

    /// Send or receive failure on the connection.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A read or write did not complete before the deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer sent something other than what the state machine expects.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server answered with an error line.
    #[error("server refused: {0}")]
    Rejected(String),
}

impl TransferError {
    pub(crate) fn resource(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::Resource {
            path: path.into(),
            source,
        }
    }
}

pub type TransferResult<T> = Result<T, TransferError>;
