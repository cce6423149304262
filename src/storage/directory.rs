//! Queue Directory
//!
//! Maps queue names to live [`Queue`] instances. Every queue lives in its own
//! subdirectory of the data directory; queues found there are reopened at
//! startup and new ones are created on first reference.

use crate::protocol::is_valid_queue_name;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::queue::{Queue, QueueStats};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The name → queue map shared by all connections.
///
/// The map lock is held across directory creation and removal so that a
/// `delete` and a concurrent first reference to the same name are ordered.
pub struct QueueDirectory {
    root: PathBuf,
    queues: Mutex<HashMap<String, Arc<Queue>>>,
}

impl std::fmt::Debug for QueueDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDirectory")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl QueueDirectory {
    /// Opens the data directory at `root`, loading every queue stored there.
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut queues = HashMap::new();
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_valid_queue_name(&name) {
                warn!(dir = %entry.path().display(), "Skipping directory with invalid queue name");
                continue;
            }

            let queue = Queue::open(name.clone(), entry.path()).await?;
            queues.insert(name, queue);
        }

        info!(root = %root.display(), queues = queues.len(), "Queue directory loaded");

        Ok(Self {
            root,
            queues: Mutex::new(queues),
        })
    }

    /// Returns the data directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the named queue, creating it if it does not exist yet.
    pub async fn get_or_create(&self, name: &str) -> StorageResult<Arc<Queue>> {
        if !is_valid_queue_name(name) {
            return Err(StorageError::InvalidName(name.to_string()));
        }

        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(name) {
            return Ok(Arc::clone(queue));
        }

        let queue = Queue::open(name, self.root.join(name)).await?;
        queues.insert(name.to_string(), Arc::clone(&queue));
        debug!(queue = name, "Queue created");
        Ok(queue)
    }

    /// Returns the named queue if it exists.
    pub async fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.lock().await.get(name).cloned()
    }

    /// Removes the named queue and all of its items.
    ///
    /// Fails with [`StorageError::QueueBusy`] while any item of the queue is
    /// open or being pushed.
    pub async fn delete(&self, name: &str) -> StorageResult<()> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownQueue(name.to_string()))?;

        if queue.is_busy() {
            return Err(StorageError::QueueBusy(name.to_string()));
        }

        queues.remove(name);
        queue.mark_deleted();

        match fs::remove_dir_all(queue.dir()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(queue = name, "Queue deleted");
        Ok(())
    }

    /// Flushes every queue. Returns the total number of items removed.
    pub async fn flush_all(&self) -> StorageResult<usize> {
        let queues: Vec<Arc<Queue>> = self.queues.lock().await.values().cloned().collect();

        let mut removed = 0;
        for queue in queues {
            removed += queue.flush().await?;
        }
        Ok(removed)
    }

    /// Returns per-queue counters, sorted by queue name.
    pub async fn stats(&self) -> Vec<(String, QueueStats)> {
        let queues = self.queues.lock().await;
        let mut stats: Vec<(String, QueueStats)> = queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Returns the number of queues.
    pub async fn len(&self) -> usize {
        self.queues.lock().await.len()
    }

    /// Returns true if there are no queues.
    pub async fn is_empty(&self) -> bool {
        self.queues.lock().await.is_empty()
    }
}
