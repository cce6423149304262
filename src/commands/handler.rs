//! Single-Step Command Handlers
//!
//! This module implements the commands that complete with one reply and no
//! payload streaming.
//!
//! ## Supported Commands
//!
//! - `stats` - Server counters followed by per-queue counters
//! - `version` - Server version
//! - `delete <queue>` - Remove a queue and all of its items
//! - `flush <queue>` - Remove every available item of a queue
//! - `flush_all` - Flush every queue
//!
//! `set` and `get` stream payloads over the socket and are driven by the
//! connection handler itself.
//!
//! ## Error Handling
//!
//! A method returns `Ok(Reply::Error(..))` for failures the client caused
//! (deleting an unknown or busy queue) and `Err(StorageError)` for failures of
//! the store, which the connection handler turns into `SERVER_ERROR` and a
//! hang-up.

use crate::protocol::Reply;
use crate::stats::Stats;
use crate::storage::{QueueDirectory, StorageError, StorageResult};
use std::sync::Arc;
use tracing::debug;

/// Executes single-step commands against the queue directory.
#[derive(Clone)]
pub struct CommandHandler {
    /// The queue directory
    directory: Arc<QueueDirectory>,
    /// Server-wide counters
    stats: Arc<Stats>,
}

impl CommandHandler {
    /// Creates a new command handler.
    pub fn new(directory: Arc<QueueDirectory>, stats: Arc<Stats>) -> Self {
        Self { directory, stats }
    }

    /// `stats`
    pub async fn cmd_stats(&self) -> StorageResult<Reply> {
        let mut lines = self.stats.snapshot();
        lines.push((
            "queues".to_string(),
            self.directory.len().await.to_string(),
        ));

        for (name, queue) in self.directory.stats().await {
            lines.push((format!("queue_{}_items", name), queue.items.to_string()));
            lines.push((format!("queue_{}_open", name), queue.open.to_string()));
        }

        Ok(Reply::Stats(lines))
    }

    /// `version`
    pub fn cmd_version(&self) -> Reply {
        Reply::Version(format!("spoolq {}", crate::VERSION))
    }

    /// `delete <queue>`
    pub async fn cmd_delete(&self, queue: &str) -> StorageResult<Reply> {
        match self.directory.delete(queue).await {
            Ok(()) => Ok(Reply::End),
            Err(e) if e.is_client_error() => Ok(Reply::error(client_message(&e))),
            Err(e) => Err(e),
        }
    }

    /// `flush <queue>`
    pub async fn cmd_flush(&self, queue: &str) -> StorageResult<Reply> {
        let removed = self.directory.get_or_create(queue).await?.flush().await?;
        debug!(queue, removed, "Flushed queue");
        Ok(Reply::End)
    }

    /// `flush_all`
    pub async fn cmd_flush_all(&self) -> StorageResult<Reply> {
        let removed = self.directory.flush_all().await?;
        debug!(removed, "Flushed all queues");
        Ok(Reply::End)
    }
}

fn client_message(e: &StorageError) -> &'static str {
    match e {
        StorageError::UnknownQueue(_) => "unknown queue",
        StorageError::QueueBusy(_) => "queue busy",
        _ => "invalid queue name",
    }
}
