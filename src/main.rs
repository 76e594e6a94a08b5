//! filestash-server: serves a directory tree over TCP.
//!
//! Features:
//! - Upload, download and removal of files under a single root
//! - Read-only uploads
//! - Length-prefixed or legacy `DONE\n` payload framing
//! - Configuration via CLI arguments or TOML file

use filestash::config::ServerConfig;
use filestash::server::Server;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let config = ServerConfig::load()?;

    // Initialize logging
    filestash::init_logging(&config.log_level);

    info!(
        listen = %config.listen,
        root = %config.root.display(),
        max_connections = config.max_connections,
        framing = ?config.transfer.framing,
        recursive_delete = config.recursive_delete,
        "Starting filestash server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(async {
        let server = Server::bind(&config).await?;
        server.run().await
    })
}
