//! TCP server for filestash sessions.
//!
//! Accepts connections and serves one command per connection, each on its
//! own task. Sessions touching the same remote path are serialized by the
//! file tree's path locks.

use crate::config::{ServerConfig, TransferConfig};
use crate::protocol::handle_connection;
use crate::storage::FileTree;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Listen backlog
const BACKLOG: i32 = 128;

/// Server instance
pub struct Server {
    listener: TcpListener,
    tree: Arc<FileTree>,
    transfer: TransferConfig,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Open the server root and bind the listening socket.
    pub async fn bind(config: &ServerConfig) -> io::Result<Self> {
        let tree = FileTree::open(&config.root, config.dir_mode, config.recursive_delete).await?;
        let listener = TcpListener::from_std(create_listener(config.listen)?)?;

        Ok(Server {
            listener,
            tree,
            transfer: config.transfer,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    /// Address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn tree(&self) -> &Arc<FileTree> {
        &self.tree
    }

    /// Accept connections until the process exits. Session failures are
    /// logged and never stop the loop.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(address = %self.local_addr()?, framing = ?self.transfer.framing, "Server listening");

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "Client connected");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let tree = Arc::clone(&self.tree);
                    let transfer = self.transfer;

                    tokio::spawn(async move {
                        match handle_connection(stream, tree, transfer).await {
                            Ok(()) => debug!(%peer, "Client disconnected"),
                            Err(e) => debug!(%peer, error = %e, "Session ended with error"),
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Build the listening socket with address reuse so a restarted server can
/// rebind while old connections linger in TIME_WAIT.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
