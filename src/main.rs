//! socket-chat: a TCP chat server
//!
//! Every client gets a welcome line on connect, then each message it sends
//! is answered with a JSON document:
//!
//! ```text
//! {"Message":"Server received: hello","Error":null,"Status":true,"Code":200}
//! ```
//!
//! Sending `exit` (any case) closes the connection. Clients are served
//! independently; nothing is shared between them.
//!
//! Configuration via CLI arguments or TOML file; with neither, the server
//! listens on 127.0.0.1:8888.

mod config;
mod connection;
mod protocol;
mod server;

use config::Config;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_connections = config.max_connections,
        idle_timeout = ?config.idle_timeout,
        "Starting socket-chat server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers.filter(|&n| n > 0) {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    let server = Server::new(config);
    if let Err(e) = runtime.block_on(server.run()) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }

    Ok(())
}
