//! Configuration for the filestash server and client.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::framing::{Framing, DEFAULT_CHUNK_SIZE, MAX_FRAME_LEN};
use crate::protocol::parser::Permission;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "filestash-server")]
#[command(author = "filestash authors")]
#[command(version = "0.1.0")]
#[command(about = "Remote file-storage server", long_about = None)]
pub struct ServerArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:2000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Directory under which all remote paths are resolved
    #[arg(short = 'r', long)]
    pub root: Option<PathBuf>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of sessions served at once
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Allow RM to remove non-empty directories
    #[arg(long)]
    pub recursive_delete: bool,

    #[command(flatten)]
    pub transfer: TransferArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[command(name = "filestash")]
#[command(author = "filestash authors")]
#[command(version = "0.1.0")]
#[command(about = "Upload, download and delete files on a filestash server", long_about = None)]
pub struct ClientArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server address (e.g., 127.0.0.1:2000)
    #[arg(short = 's', long)]
    pub server: Option<String>,

    #[command(flatten)]
    pub transfer: TransferArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: ClientCommand,
}

/// Transfer options shared by both binaries
#[derive(clap::Args, Debug, Default)]
pub struct TransferArgs {
    /// Payload framing; both peers must use the same one
    #[arg(long, value_enum)]
    pub framing: Option<Framing>,

    /// Payload chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Per-operation I/O timeout in seconds (0 = wait forever)
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,
}

/// Client operations
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Upload a local file
    #[command(name = "WRITE")]
    Write {
        local: PathBuf,
        remote: String,
        /// -r stores the file read-only, -rw read-write
        #[arg(value_parser = parse_permission, allow_hyphen_values = true, default_value = "-rw")]
        permission: Permission,
    },
    /// Download a remote file
    #[command(name = "GET")]
    Get { remote: String, local: PathBuf },
    /// Delete a remote file or empty folder
    #[command(name = "RM")]
    Rm { remote: String },
}

fn parse_permission(s: &str) -> Result<Permission, String> {
    s.parse().map_err(|e: crate::error::ParseError| e.to_string())
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub transfer: TransferSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Server root directory
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum concurrent sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Allow RM on non-empty directories
    #[serde(default)]
    pub recursive_delete: bool,
    /// Mode for directories created during uploads
    #[serde(default = "default_dir_mode")]
    pub dir_mode: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            root: default_root(),
            workers: None,
            max_connections: default_max_connections(),
            recursive_delete: false,
            dir_mode: default_dir_mode(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    /// Server to connect to
    #[serde(default = "default_listen")]
    pub server: String,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server: default_listen(),
        }
    }
}

/// Payload transfer configuration
#[derive(Debug, Deserialize)]
pub struct TransferSection {
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Seconds; 0 disables the deadline
    #[serde(default = "default_io_timeout")]
    pub io_timeout: u64,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            chunk_size: default_chunk_size(),
            io_timeout: default_io_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:2000".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from("./server_root")
}

fn default_max_connections() -> usize {
    64
}

fn default_dir_mode() -> u32 {
    0o755
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_io_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved transfer settings used by both sides of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub framing: Framing,
    pub chunk_size: usize,
    /// Deadline for each individual read or write
    pub io_timeout: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_timeout: Some(Duration::from_secs(default_io_timeout())),
        }
    }
}

impl TransferConfig {
    fn merge(cli: &TransferArgs, file: &TransferSection) -> Result<Self, ConfigError> {
        let chunk_size = cli.chunk_size.unwrap_or(file.chunk_size);
        if chunk_size == 0 || chunk_size > MAX_FRAME_LEN {
            return Err(ConfigError::Invalid(format!(
                "chunk_size must be between 1 and {MAX_FRAME_LEN}"
            )));
        }
        let timeout = cli.timeout.unwrap_or(file.io_timeout);

        Ok(Self {
            framing: cli.framing.unwrap_or(file.framing),
            chunk_size,
            io_timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
        })
    }
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub root: PathBuf,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub recursive_delete: bool,
    pub dir_mode: u32,
    pub transfer: TransferConfig,
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ServerArgs::parse())
    }

    pub fn from_args(cli: ServerArgs) -> Result<Self, ConfigError> {
        let toml_config = load_toml(cli.config.as_ref())?;

        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(listen.clone()))?;
        let max_connections = cli
            .max_connections
            .unwrap_or(toml_config.server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }

        Ok(ServerConfig {
            listen,
            root: cli.root.unwrap_or(toml_config.server.root),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections,
            recursive_delete: cli.recursive_delete || toml_config.server.recursive_delete,
            dir_mode: toml_config.server.dir_mode,
            transfer: TransferConfig::merge(&cli.transfer, &toml_config.transfer)?,
            log_level: merge_log_level(cli.log_level, toml_config.logging.level),
        })
    }
}

/// Final resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub transfer: TransferConfig,
    pub log_level: String,
}

impl ClientConfig {
    /// Load configuration and the requested operation from the command line.
    pub fn load() -> Result<(Self, ClientCommand), ConfigError> {
        Self::from_args(ClientArgs::parse())
    }

    pub fn from_args(cli: ClientArgs) -> Result<(Self, ClientCommand), ConfigError> {
        let toml_config = load_toml(cli.config.as_ref())?;

        let config = ClientConfig {
            server: cli.server.unwrap_or(toml_config.client.server),
            transfer: TransferConfig::merge(&cli.transfer, &toml_config.transfer)?,
            log_level: merge_log_level(cli.log_level, toml_config.logging.level),
        };
        Ok((config, cli.command))
    }
}

fn load_toml(path: Option<&PathBuf>) -> Result<TomlConfig, ConfigError> {
    let Some(config_path) = path else {
        return Ok(TomlConfig::default());
    };
    let contents = std::fs::read_to_string(config_path)
        .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
    toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))
}

fn merge_log_level(cli: String, file: String) -> String {
    if cli != "info" {
        cli
    } else {
        file
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
