//! Durable FIFO Queue with Streaming Push and Reliable Pop
//!
//! This module implements a single named queue stored on disk.
//!
//! ## On-Disk Layout
//!
//! ```text
//! <data_dir>/<queue>/
//!     00000000000000000001.item    committed item, id 1
//!     00000000000000000002.item    committed item, id 2
//!     7.tmp                        push in progress
//! ```
//!
//! An item is written into a `.tmp` file chunk by chunk and becomes visible
//! only when the push is committed: the file is synced and atomically renamed
//! to its `.item` name. A crash or disconnect mid-push therefore never leaves
//! a partial item behind; leftover `.tmp` files are discarded on startup.
//!
//! ## Reliable Pop
//!
//! Popping an item hands out an [`OpenItem`]. While it exists the item is
//! invisible to other consumers. It is resolved in exactly one of three ways:
//!
//! - [`OpenItem::close`] deletes the item permanently
//! - [`OpenItem::abort`] returns it to the head of the queue
//! - dropping it unresolved behaves like `abort`
//!
//! The last rule is what makes a dropped connection safe: the queue reclaims
//! the item itself, without any cleanup code in the connection handler.
//!
//! ## Concurrency Model
//!
//! The in-memory index sits behind a `std::sync::Mutex` that is only held
//! for short bookkeeping sections and never across an `.await`. Consumers
//! waiting for an item park on a `tokio::sync::Notify`.

use crate::storage::error::{StorageError, StorageResult};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// File extension of committed items
const ITEM_EXT: &str = "item";

/// File extension of pushes in progress
const TMP_EXT: &str = "tmp";

/// Mutable bookkeeping for one queue.
#[derive(Debug, Default)]
struct QueueState {
    /// Ids of committed items that are not currently open, oldest first.
    /// Aborted items keep their id and so return to their original position.
    available: BTreeSet<u64>,
    /// Number of items fetched but not yet closed or aborted
    open: usize,
    /// Number of pushes in progress
    pushing: usize,
    /// Id handed to the next committed item
    next_id: u64,
    /// Set once the queue has been removed from its directory
    deleted: bool,
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items available for fetching
    pub items: usize,
    /// Items fetched and not yet confirmed
    pub open: usize,
    /// Pushes in progress
    pub pushing: usize,
}

/// A named, durable, ordered queue of byte-string items.
///
/// Queues are shared between connections through an `Arc`; every method
/// takes `&self`.
pub struct Queue {
    name: String,
    dir: PathBuf,
    state: Mutex<QueueState>,
    tmp_seq: AtomicU64,
    available: Notify,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("items", &stats.items)
            .field("open", &stats.open)
            .finish()
    }
}

impl Queue {
    /// Opens the queue stored in `dir`, creating the directory if needed.
    ///
    /// Committed items found on disk are loaded in id order; incomplete
    /// pushes left by a previous run are deleted.
    pub async fn open(name: impl Into<String>, dir: impl Into<PathBuf>) -> StorageResult<Arc<Self>> {
        let name = name.into();
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut available = BTreeSet::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let stem = path.file_stem().and_then(|s| s.to_str());
            match (stem, path.extension().and_then(|e| e.to_str())) {
                (Some(stem), Some(ITEM_EXT)) => match stem.parse::<u64>() {
                    Ok(id) => {
                        available.insert(id);
                    }
                    Err(_) => warn!(path = %path.display(), "Ignoring malformed item file"),
                },
                (_, Some(TMP_EXT)) => {
                    debug!(path = %path.display(), "Discarding incomplete push");
                    fs::remove_file(&path).await?;
                }
                _ => warn!(path = %path.display(), "Ignoring unexpected file in queue directory"),
            }
        }

        let next_id = available.last().map_or(1, |id| id + 1);
        debug!(queue = %name, items = available.len(), "Queue opened");

        Ok(Arc::new(Self {
            name,
            dir,
            state: Mutex::new(QueueState {
                available,
                next_id,
                ..QueueState::default()
            }),
            tmp_seq: AtomicU64::new(0),
            available: Notify::new(),
        }))
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the directory holding the queue's items.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns a snapshot of the queue's counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.state();
        QueueStats {
            items: state.available.len(),
            open: state.open,
            pushing: state.pushing,
        }
    }

    /// Returns the number of items available for fetching.
    pub fn len(&self) -> usize {
        self.state().available.len()
    }

    /// Returns true if no item is available for fetching.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if items are open or pushes are in progress.
    pub fn is_busy(&self) -> bool {
        let state = self.state();
        state.open > 0 || state.pushing > 0
    }

    /// Starts streaming a new item of exactly `size` bytes into the queue.
    pub async fn begin_push(self: &Arc<Self>, size: u64) -> StorageResult<PushStream> {
        {
            let mut state = self.state();
            if state.deleted {
                return Err(StorageError::QueueDeleted(self.name.clone()));
            }
            state.pushing += 1;
        }

        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self.dir.join(format!("{}.{}", seq, TMP_EXT));
        let file = match File::create(&tmp_path).await {
            Ok(file) => file,
            Err(e) => {
                self.state().pushing -= 1;
                return Err(e.into());
            }
        };

        trace!(queue = %self.name, size, "Push started");

        Ok(PushStream {
            queue: Arc::clone(self),
            tmp_path,
            file,
            declared: size,
            written: 0,
            committed: false,
        })
    }

    /// Fetches the oldest available item, waiting up to `timeout` for one
    /// to arrive if the queue is empty.
    ///
    /// Returns `Ok(None)` if no item became available in time. A zero
    /// timeout returns immediately. A queue deleted while waiting is treated
    /// as empty.
    pub async fn pop_open(self: &Arc<Self>, timeout: Duration) -> StorageResult<Option<OpenItem>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so a push landing between
            // the check and the wait is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.take_next() {
                // Returns the id to the queue if this future is dropped
                // while the item file is being opened.
                let mut reservation = Reservation {
                    queue: self,
                    id,
                    armed: true,
                };
                let opened = self.open_item(id).await;
                reservation.armed = false;
                return opened.map(Some);
            }

            if self.state().deleted {
                return Ok(None);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Removes every available item. Open items are not affected.
    ///
    /// Returns the number of items removed.
    pub async fn flush(&self) -> StorageResult<usize> {
        let ids = std::mem::take(&mut self.state().available);
        let count = ids.len();

        for id in ids {
            self.remove_item_file(id).await?;
        }

        debug!(queue = %self.name, removed = count, "Queue flushed");
        Ok(count)
    }

    /// Marks the queue as deleted and wakes any waiting consumers.
    pub(crate) fn mark_deleted(&self) {
        self.state().deleted = true;
        self.available.notify_waiters();
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn item_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{:020}.{}", id, ITEM_EXT))
    }

    fn take_next(&self) -> Option<u64> {
        let mut state = self.state();
        if state.deleted {
            return None;
        }
        let id = state.available.pop_first()?;
        state.open += 1;
        Some(id)
    }

    async fn open_item(self: &Arc<Self>, id: u64) -> StorageResult<OpenItem> {
        let path = self.item_path(id);
        let opened = async {
            let file = File::open(&path).await?;
            let size = file.metadata().await?.len();
            Ok::<_, std::io::Error>((file, size))
        }
        .await;

        match opened {
            Ok((file, size)) => {
                trace!(queue = %self.name, id, size, "Item opened");
                Ok(OpenItem {
                    queue: Arc::clone(self),
                    id,
                    file,
                    size,
                    remaining: size,
                    resolved: false,
                })
            }
            Err(e) => {
                // The item stays on disk and is retried after a restart.
                warn!(queue = %self.name, id, error = %e, "Failed to open item");
                self.state().open -= 1;
                Err(e.into())
            }
        }
    }

    async fn commit_push(&self, tmp_path: &Path) -> StorageResult<u64> {
        let id = {
            let mut state = self.state();
            if state.deleted {
                return Err(StorageError::QueueDeleted(self.name.clone()));
            }
            let id = state.next_id;
            state.next_id += 1;
            id
        };

        fs::rename(tmp_path, self.item_path(id)).await?;

        // The item is complete under its final name from here on, so it is
        // published even if the directory entry cannot be synced.
        if let Err(e) = sync_dir(&self.dir).await {
            warn!(queue = %self.name, id, error = %e, "Failed to sync queue directory");
        }

        self.state().available.insert(id);
        self.available.notify_waiters();
        Ok(id)
    }

    /// Ends an open item; `requeue` puts it back in the available set.
    fn release(&self, id: u64, requeue: bool) {
        {
            let mut state = self.state();
            state.open = state.open.saturating_sub(1);
            if !requeue || state.deleted {
                return;
            }
            state.available.insert(id);
        }
        self.available.notify_waiters();
    }

    async fn remove_item_file(&self, id: u64) -> StorageResult<()> {
        match fs::remove_file(self.item_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Syncs a directory so that renames inside it are durable.
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    File::open(dir).await?.sync_all().await?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// An id taken from the available set whose `OpenItem` does not exist yet.
struct Reservation<'a> {
    queue: &'a Queue,
    id: u64,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.release(self.id, true);
        }
    }
}

/// A push cursor: an item being streamed into a queue.
///
/// Dropping the stream without calling [`PushStream::commit`] discards
/// everything written so far.
#[derive(Debug)]
pub struct PushStream {
    queue: Arc<Queue>,
    tmp_path: PathBuf,
    file: File,
    declared: u64,
    written: u64,
    committed: bool,
}

impl PushStream {
    /// Returns the number of bytes still expected.
    pub fn remaining(&self) -> u64 {
        self.declared - self.written
    }

    /// Appends one chunk to the item.
    pub async fn write(&mut self, chunk: &[u8]) -> StorageResult<()> {
        let written = self.written + chunk.len() as u64;
        if written > self.declared {
            return Err(StorageError::SizeMismatch {
                declared: self.declared,
                written,
            });
        }

        self.file.write_all(chunk).await?;
        self.written = written;
        Ok(())
    }

    /// Makes the item durable and visible to consumers.
    ///
    /// Returns the id assigned to the item.
    pub async fn commit(mut self) -> StorageResult<u64> {
        if self.written != self.declared {
            return Err(StorageError::SizeMismatch {
                declared: self.declared,
                written: self.written,
            });
        }

        self.file.flush().await?;
        self.file.sync_all().await?;

        let id = self.queue.commit_push(&self.tmp_path).await?;
        self.committed = true;
        trace!(queue = %self.queue.name, id, size = self.declared, "Push committed");
        Ok(id)
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        if !self.committed {
            debug!(queue = %self.queue.name, written = self.written, "Push aborted");
            match std::fs::remove_file(&self.tmp_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(
                    queue = %self.queue.name,
                    path = %self.tmp_path.display(),
                    error = %e,
                    "Failed to remove incomplete push"
                ),
            }
        }
        let mut state = self.queue.state();
        state.pushing = state.pushing.saturating_sub(1);
    }
}

/// A pop cursor over a fetched, unconfirmed item.
///
/// Dropping an unresolved `OpenItem` returns the item to its queue.
#[derive(Debug)]
pub struct OpenItem {
    queue: Arc<Queue>,
    id: u64,
    file: File,
    size: u64,
    remaining: u64,
    resolved: bool,
}

impl OpenItem {
    /// Returns the item's id within its queue.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the total payload size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the number of payload bytes not read yet.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Returns the name of the queue the item belongs to.
    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    /// Reads the next chunk of at most `max` bytes into `buf`.
    ///
    /// `buf` is resized to the chunk length; `Ok(0)` means the whole item
    /// has been read.
    pub async fn read_chunk(&mut self, buf: &mut Vec<u8>, max: usize) -> StorageResult<usize> {
        let want = self.remaining.min(max as u64) as usize;
        buf.resize(want, 0);
        if want == 0 {
            return Ok(0);
        }

        match self.file.read_exact(&mut buf[..]).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(StorageError::Truncated {
                    id: self.id,
                    expected: self.size,
                });
            }
            Err(e) => return Err(e.into()),
        }

        self.remaining -= want as u64;
        Ok(want)
    }

    /// Confirms the item: it is removed from the queue permanently.
    ///
    /// If removal fails the item is returned to the queue instead.
    pub async fn close(mut self) -> StorageResult<()> {
        self.queue.remove_item_file(self.id).await?;
        self.resolved = true;
        self.queue.release(self.id, false);
        trace!(queue = %self.queue.name, id = self.id, "Item closed");
        Ok(())
    }

    /// Returns the item to the head of its queue.
    pub fn abort(mut self) {
        self.resolved = true;
        self.queue.release(self.id, true);
        trace!(queue = %self.queue.name, id = self.id, "Item aborted");
    }
}

impl Drop for OpenItem {
    fn drop(&mut self) {
        if !self.resolved {
            debug!(queue = %self.queue.name, id = self.id, "Open item dropped, returning it");
            self.queue.release(self.id, true);
        }
    }
}
