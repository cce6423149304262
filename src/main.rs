//! spoolq - A Persistent Work-Queue Server
//!
//! This is the main entry point for the spoolq server.
//! It parses the configuration, opens the queue directory, and handles
//! incoming connections on a single-threaded event loop.

use clap::Parser;
use spoolq::connection::handle_connection;
use spoolq::storage::QueueDirectory;
use spoolq::{Config, Stats};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments and environment
    let config = Config::parse();

    // Set up logging; RUST_LOG takes precedence over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(version = spoolq::VERSION, "spoolq starting");

    // Open the queue directory (shared across all connections)
    let directory = Arc::new(QueueDirectory::open(config.data_dir.clone()).await?);
    info!(
        data_dir = %config.data_dir.display(),
        queues = directory.len().await,
        "Queue directory loaded"
    );

    let stats = Arc::new(Stats::new());

    // Bind the TCP listener
    let listener = TcpListener::bind(config.bind_address()).await?;
    info!(
        addr = %config.bind_address(),
        chunk_size = config.chunk_size,
        "Listening"
    );

    // Set up graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    // Main accept loop
    tokio::select! {
        _ = accept_loop(listener, directory, stats, config.chunk_size) => {}
        _ = shutdown => {}
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Main loop that accepts incoming connections
async fn accept_loop(
    listener: TcpListener,
    directory: Arc<QueueDirectory>,
    stats: Arc<Stats>,
    chunk_size: usize,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let directory = Arc::clone(&directory);
                let stats = Arc::clone(&stats);

                // Spawn a task to handle this connection
                tokio::spawn(async move {
                    handle_connection(stream, addr, directory, stats, chunk_size).await;
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}
