//! filestash: a minimal remote file store.
//!
//! A server exposes one directory tree over TCP and a client uploads,
//! downloads and removes files inside it. Every connection carries a single
//! command:
//! - `WRITE` uploads a file, optionally marking it read-only
//! - `GET` downloads a file
//! - `RM` deletes a file or directory
//!
//! Configuration comes from CLI arguments or a TOML file.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod storage;

use tracing_subscriber::EnvFilter;

/// Install the global log subscriber. `RUST_LOG` overrides `level`.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
