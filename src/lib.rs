//! # spoolq - A Persistent Work-Queue Server
//!
//! spoolq keeps named FIFO queues of opaque byte-string items on disk and
//! serves them over TCP using a small memcached-style text protocol:
//! producers `set` items, consumers `get` them.
//!
//! ## Features
//!
//! - **Durable**: an item is acknowledged only once it is synced to disk
//! - **Streaming**: payloads move in bounded chunks, so item size does not
//!   drive memory use
//! - **Reliable Reads**: `get <queue>/open` hands out an item that returns to
//!   the head of the queue unless the consumer confirms it with `/close`
//! - **Blocking Reads**: consumers can wait for an item with a timeout
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              spoolq                                     │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │                            │ set / get        │                         │
//! │                            ▼                  ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │  Request    │    │              QueueDirectory                  │   │
//! │  │  Parser     │    │  ┌────────┐ ┌────────┐ ┌────────┐            │   │
//! │  │             │    │  │ Queue  │ │ Queue  │ │ Queue  │  ...       │   │
//! │  └─────────────┘    │  └───┬────┘ └───┬────┘ └───┬────┘            │   │
//! │                     └──────┼──────────┼──────────┼─────────────────┘   │
//! │                            ▼          ▼          ▼                      │
//! │                      <data_dir>/<queue>/<id>.item                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use spoolq::connection::handle_connection;
//! use spoolq::storage::QueueDirectory;
//! use spoolq::Stats;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let directory = Arc::new(QueueDirectory::open("./data").await?);
//!     let stats = Arc::new(Stats::new());
//!     let listener = TcpListener::bind("127.0.0.1:22133").await?;
//!
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         let directory = Arc::clone(&directory);
//!         let stats = Arc::clone(&stats);
//!
//!         tokio::spawn(handle_connection(stream, addr, directory, stats, 1024));
//!     }
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `set <queue> <flags> <exptime> <bytes>` followed by the payload
//! - `get <queue>[/open][/close][/abort][/peek][/t=<ms>] [<ms>]`
//! - `delete <queue>`
//! - `flush <queue>` / `flush_all`
//! - `stats`
//! - `version`
//!
//! ## Module Overview
//!
//! - [`protocol`]: request parser and reply types
//! - [`storage`]: durable queues with streaming push and reliable pop
//! - [`commands`]: single-step command handlers
//! - [`connection`]: per-client request loop and payload streaming
//! - [`stats`]: server-wide counters
//! - [`config`]: command-line and environment configuration

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod stats;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use config::Config;
pub use connection::{handle_connection, ConnectionError, ConnectionHandler};
pub use protocol::{ParseError, Reply, Request, RequestParser};
pub use stats::Stats;
pub use storage::{QueueDirectory, StorageError};

/// The default port spoolq listens on (same as kestrel)
pub const DEFAULT_PORT: u16 = 22133;

/// The default host spoolq binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// The default upper bound on bytes moved per payload I/O step
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Version of spoolq
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
