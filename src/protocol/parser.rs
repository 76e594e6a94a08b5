//! Command codec and server response lines.
//!
//! A command is a single space-delimited text line:
//!
//! ```text
//! WRITE <local-file> <remote-file> <-r|-rw>
//! GET <remote-file> <local-file>
//! RM <remote-file-or-folder>
//! ```
//!
//! There is no escaping, so paths must not contain whitespace.

use bytes::BytesMut;
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// Tokens longer than this are truncated, not rejected.
pub const MAX_TOKEN_LENGTH: usize = 255;

/// Maximum length of a command line, terminator included.
pub const MAX_COMMAND_LENGTH: usize = 8192;

/// Permission requested for an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl Permission {
    /// Wire token for this permission.
    pub fn flag(&self) -> &'static str {
        match self {
            Permission::ReadOnly => "-r",
            Permission::ReadWrite => "-rw",
        }
    }

    /// Unix mode bits applied to the stored file.
    pub fn mode(&self) -> u32 {
        match self {
            Permission::ReadOnly => 0o444,
            Permission::ReadWrite => 0o644,
        }
    }
}

impl FromStr for Permission {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "-r" => Ok(Permission::ReadOnly),
            "-rw" => Ok(Permission::ReadWrite),
            other => Err(ParseError::InvalidPermission(other.to_string())),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag())
    }
}

/// Request keyword, without arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Write,
    Get,
    Rm,
}

impl CommandKind {
    /// Usage text sent back when the command is malformed.
    pub fn usage(&self) -> &'static str {
        match self {
            CommandKind::Write => "WRITE <local-file> <remote-file> [-r|-rw]",
            CommandKind::Get => "GET <remote-file> <local-file>",
            CommandKind::Rm => "RM <remote-file-or-folder>",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommandKind::Write => "WRITE",
            CommandKind::Get => "GET",
            CommandKind::Rm => "RM",
        })
    }
}

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Upload `local` (client side) to `remote` (server side).
    Write {
        local: String,
        remote: String,
        permission: Permission,
    },
    /// Download `remote` (server side) to `local` (client side).
    Get { remote: String, local: String },
    /// Delete `remote`.
    Rm { remote: String },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Write { .. } => CommandKind::Write,
            Command::Get { .. } => CommandKind::Get,
            Command::Rm { .. } => CommandKind::Rm,
        }
    }

    /// The server-side path this command operates on.
    pub fn remote(&self) -> &str {
        match self {
            Command::Write { remote, .. } | Command::Get { remote, .. } | Command::Rm { remote } => {
                remote
            }
        }
    }

    /// Encode as a newline-terminated command line.
    pub fn encode(&self) -> String {
        match self {
            Command::Write {
                local,
                remote,
                permission,
            } => format!("WRITE {local} {remote} {permission}\n"),
            Command::Get { remote, local } => format!("GET {remote} {local}\n"),
            Command::Rm { remote } => format!("RM {remote}\n"),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode().trim_end())
    }
}

/// Decoder for command lines
pub struct Parser;

impl Parser {
    /// Decode one command line. A trailing `\n` or `\r\n` is optional.
    pub fn parse(line: &[u8]) -> Result<Command, ParseError> {
        if line.len() > MAX_COMMAND_LENGTH {
            return Err(ParseError::TooLong);
        }

        let line = String::from_utf8_lossy(line);
        let parts: Vec<String> = line.split_whitespace().map(truncate_token).collect();
        let Some(keyword) = parts.first() else {
            return Err(ParseError::Empty);
        };

        match keyword.as_str() {
            "WRITE" => Self::parse_write(&parts[1..]),
            "GET" => Self::parse_get(&parts[1..]),
            "RM" => Self::parse_rm(&parts[1..]),
            _ => Err(ParseError::UnknownCommand(keyword.clone())),
        }
    }

    fn parse_write(args: &[String]) -> Result<Command, ParseError> {
        match args {
            // Legacy form without a permission token
            [local, remote] => Ok(Command::Write {
                local: local.clone(),
                remote: remote.clone(),
                permission: Permission::default(),
            }),
            [local, remote, perm] => Ok(Command::Write {
                local: local.clone(),
                remote: remote.clone(),
                permission: perm.parse()?,
            }),
            _ => Err(ParseError::InvalidFormat(CommandKind::Write)),
        }
    }

    fn parse_get(args: &[String]) -> Result<Command, ParseError> {
        match args {
            [remote, local] => Ok(Command::Get {
                remote: remote.clone(),
                local: local.clone(),
            }),
            _ => Err(ParseError::InvalidFormat(CommandKind::Get)),
        }
    }

    fn parse_rm(args: &[String]) -> Result<Command, ParseError> {
        match args {
            [remote] => Ok(Command::Rm {
                remote: remote.clone(),
            }),
            _ => Err(ParseError::InvalidFormat(CommandKind::Rm)),
        }
    }
}

/// Truncate a token to [`MAX_TOKEN_LENGTH`] bytes on a character boundary.
fn truncate_token(token: &str) -> String {
    if token.len() <= MAX_TOKEN_LENGTH {
        return token.to_string();
    }
    let mut end = MAX_TOKEN_LENGTH;
    while !token.is_char_boundary(end) {
        end -= 1;
    }
    token[..end].to_string()
}

/// Server response lines
pub struct Response;

impl Response {
    pub const READY: &'static [u8] = b"READY\n";

    /// Proceed with the payload transfer.
    pub fn ready() -> &'static [u8] {
        Self::READY
    }

    /// WRITE acknowledgment.
    pub fn transfer_complete() -> &'static [u8] {
        b"File transfer complete\n"
    }

    /// RM success.
    pub fn deleted() -> &'static [u8] {
        b"SUCCESS: File or folder deleted\n"
    }

    /// RM failure. Not-found and not-empty are deliberately indistinguishable.
    pub fn delete_failed() -> &'static [u8] {
        b"ERROR: Failed to delete file or folder\n"
    }

    /// GET on a missing file.
    pub fn not_found() -> &'static [u8] {
        b"ERROR: File not found\n"
    }

    /// WRITE over a read-only destination.
    pub fn read_only() -> &'static [u8] {
        b"ERROR: File is read-only\n"
    }

    /// Unknown keyword.
    pub fn unsupported() -> &'static [u8] {
        b"ERROR: Unsupported command\n"
    }

    /// Generic error line.
    pub fn error(msg: &str) -> BytesMut {
        let mut response = BytesMut::with_capacity(8 + msg.len());
        response.extend_from_slice(b"ERROR: ");
        response.extend_from_slice(msg.as_bytes());
        response.extend_from_slice(b"\n");
        response
    }

    /// Diagnostic for a malformed command.
    pub fn invalid_format(kind: CommandKind) -> BytesMut {
        BytesMut::from(format!("Invalid command format. Use: {}\n", kind.usage()).as_bytes())
    }

    /// Diagnostic line for any parse failure.
    pub fn for_parse_error(err: &ParseError) -> BytesMut {
        match err {
            ParseError::Empty | ParseError::UnknownCommand(_) => {
                BytesMut::from(Self::unsupported())
            }
            ParseError::InvalidFormat(kind) => Self::invalid_format(*kind),
            ParseError::InvalidPermission(_) => Self::invalid_format(CommandKind::Write),
            ParseError::TooLong => Self::error("Command line too long"),
        }
    }

    /// Whether a response line grants the transfer. Only the first six bytes
    /// are inspected.
    pub fn is_ready(line: &[u8]) -> bool {
        line.starts_with(Self::READY)
    }
}

/// Find `\n` in buffer.
pub(crate) fn find_newline(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n')
}
