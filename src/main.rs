//! echo-reactor: a concurrent TCP echo server
//!
//! One reactor thread waits for edge-triggered readiness and accepts new
//! connections. Readable clients are handed to a fixed pool of worker
//! threads through a bounded task queue; each worker borrows a buffer from a
//! fixed-block pool, echoes everything the client sent, and hands the buffer
//! back.
//!
//! Features:
//! - Load shedding: a full task queue or an empty block pool closes the
//!   connection instead of queueing or allocating
//! - At most one in-flight task per connection
//! - Graceful shutdown on SIGINT / SIGTERM
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;
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
        listen = %config.listen_addr(),
        workers = config.workers,
        queue_capacity = config.queue_capacity,
        block_size = config.block_size,
        pool_capacity = config.pool_capacity,
        "Starting echo server"
    );

    let server = Server::start(&config).map_err(|e| {
        error!(error = %e, "Failed to start server");
        e
    })?;

    info!(addr = %server.local_addr(), "Accepting connections");

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("Signal received, shutting down");
        shutdown.shutdown();
    })?;

    let report = server.run()?;
    info!(
        state = ?report.state,
        connections_closed = report.connections_closed,
        blocks_in_use = report.blocks_in_use,
        "Echo server stopped"
    );
    Ok(())
}
