//! Connection Handler Module
//!
//! This module manages individual client connections to spoolq.
//! Each client connection is handled by its own async task; all tasks run
//! on one event loop and share the queue directory and the stats counters.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (main.rs)                                │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept()
//!                        ▼
//!           ┌────────────────────────┐
//!           │   For each client...   │
//!           └────────────┬───────────┘
//!                        │
//!                        │ spawn task
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ Read line   │───>│ Parse line  │───>│ Run op      │     │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘     │
//! │         ▲                                     │             │
//! │         │                                     ▼             │
//! │         │          chunked payload ◄──── set / get          │
//! │         │                                     │             │
//! │         └────────────── reply ◄───────────────┘             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Async I/O**: Uses Tokio for non-blocking network operations
//! - **Bounded Memory**: Payloads move in chunks of at most `chunk_size` bytes
//! - **Pipelining**: Multiple requests may arrive in a single TCP packet
//! - **Reliable Reads**: An item left open is returned to its queue when the
//!   connection ends
//!
//! ## Example
//!
//! ```ignore
//! use spoolq::connection::handle_connection;
//! use spoolq::storage::QueueDirectory;
//! use spoolq::Stats;
//! use std::sync::Arc;
//!
//! let directory = Arc::new(QueueDirectory::open("./data").await?);
//! let stats = Arc::new(Stats::new());
//!
//! // For each accepted connection...
//! let (stream, addr) = listener.accept().await?;
//! tokio::spawn(handle_connection(stream, addr, directory, stats, 1024));
//! ```

pub mod handler;

// Re-export commonly used types
pub use handler::{handle_connection, ConnectionError, ConnectionHandler, MAX_LINE_LENGTH};
