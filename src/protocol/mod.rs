//! filestash wire protocol.
//!
//! Each TCP connection carries exactly one command and its exchange:
//!
//! ```text
//! Client: WRITE <local> <remote> <-r|-rw>\n
//! Server: READY\n
//! Client: <payload frames> <end-of-stream marker>
//! Server: File transfer complete\n
//!
//! Client: GET <remote> <local>\n
//! Server: READY\n <payload frames> <end-of-stream marker>
//!     or: ERROR: File not found\n
//!
//! Client: RM <remote>\n
//! Server: SUCCESS: File or folder deleted\n
//!     or: ERROR: Failed to delete file or folder\n
//! ```
//!
//! Malformed commands are answered with `Invalid command format. Use: ...`
//! and unknown keywords with `ERROR: Unsupported command`. Either way the
//! connection is closed afterwards.
//!
//! ## Modules
//! - `parser`: command codec and response lines
//! - `framing`: payload frames and end-of-stream marker
//! - `session`: buffered stream with per-operation deadlines
//! - `handler`: server side of the exchange

pub mod framing;
pub mod handler;
pub mod parser;
pub mod session;

pub use framing::Framing;
pub use handler::handle_connection;
pub use parser::{Command, CommandKind, Parser, Permission, Response};
pub use session::Session;
