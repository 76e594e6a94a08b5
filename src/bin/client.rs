//! filestash: command-line client.
//!
//! ```text
//! filestash WRITE <local> <remote> [-r|-rw]
//! filestash GET <remote> <local>
//! filestash RM <remote>
//! ```

use filestash::client;
use filestash::config::ClientConfig;
use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    let (config, command) = match ClientConfig::load() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    filestash::init_logging(&config.log_level);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(client::run(&config, command)) {
        Ok(outcome) => {
            println!("{outcome}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(server = %config.server, error = %e, "Operation failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
