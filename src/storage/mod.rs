//! Storage Module
//!
//! This module provides the durable queue store for spoolq: named FIFO
//! queues kept on disk, with streaming push and two-phase (reliable) pop.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     QueueDirectory                          │
//! │          name ──> Arc<Queue>   (tokio Mutex<HashMap>)       │
//! └──────────────┬──────────────────────────────┬───────────────┘
//!                │                              │
//!                ▼                              ▼
//!   ┌────────────────────────┐     ┌────────────────────────┐
//!   │ Queue "jobs"           │     │ Queue "mail"           │
//!   │  available: {1, 2, 5}  │     │  available: {}         │
//!   │  open: 1   pushing: 0  │     │  open: 0   pushing: 1  │
//!   └───────────┬────────────┘     └────────────────────────┘
//!               │
//!               ▼
//!   <data_dir>/jobs/00000000000000000001.item ...
//! ```
//!
//! ## Features
//!
//! - **Streaming**: items move through [`PushStream`] and [`OpenItem`] one
//!   chunk at a time, so memory use does not depend on item size
//! - **Atomic Commit**: pushes become visible only after fsync + rename
//! - **Reliable Pop**: fetched items stay invisible until closed; aborting
//!   or dropping an [`OpenItem`] returns the item to the head of the queue
//! - **Blocking Get**: consumers can wait for an item with a timeout
//!
//! ## Example
//!
//! ```
//! use spoolq::storage::QueueDirectory;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let tmp = tempfile::tempdir().unwrap();
//! let directory = QueueDirectory::open(tmp.path()).await.unwrap();
//! let queue = directory.get_or_create("jobs").await.unwrap();
//!
//! let mut push = queue.begin_push(5).await.unwrap();
//! push.write(b"hello").await.unwrap();
//! push.commit().await.unwrap();
//!
//! let item = queue.pop_open(Duration::ZERO).await.unwrap().unwrap();
//! assert_eq!(item.size(), 5);
//! item.close().await.unwrap();
//! # });
//! ```

pub mod directory;
pub mod error;
pub mod queue;

// Re-export commonly used types
pub use directory::QueueDirectory;
pub use error::{StorageError, StorageResult};
pub use queue::{OpenItem, PushStream, Queue, QueueStats};
