//! Process-wide statistics counters.
//!
//! One [`Stats`] instance is shared by reference between all connections.
//! Counters are plain atomics with `Ordering::Relaxed`: each is independent
//! and only read for the `stats` command.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Server-wide counters.
#[derive(Debug)]
pub struct Stats {
    started: Instant,
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// `get` requests received
    pub cmd_get: AtomicU64,
    /// `set` requests received
    pub cmd_set: AtomicU64,
    /// `get` requests that returned an item
    pub get_hits: AtomicU64,
    /// `get` requests that found the queue empty
    pub get_misses: AtomicU64,
    /// Client and server error replies sent
    pub errors: AtomicU64,
    /// Items committed by `set`
    pub items_enqueued: AtomicU64,
    /// Items permanently removed by `get`
    pub items_dequeued: AtomicU64,
    /// Total bytes read from sockets
    pub bytes_read: AtomicU64,
    /// Total bytes written to sockets
    pub bytes_written: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            connections_accepted: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            cmd_get: AtomicU64::new(0),
            cmd_set: AtomicU64::new(0),
            get_hits: AtomicU64::new(0),
            get_misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            items_enqueued: AtomicU64::new(0),
            items_dequeued: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Records a new connection and returns its id.
    pub fn connection_opened(&self) -> u64 {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.connections_accepted.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn cmd_get(&self) {
        self.cmd_get.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cmd_set(&self) {
        self.cmd_set.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_hit(&self) {
        self.get_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_miss(&self) {
        self.get_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn item_enqueued(&self) {
        self.items_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn item_dequeued(&self) {
        self.items_dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Returns the seconds elapsed since the counters were created.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Returns the counters as `(name, value)` pairs in display order.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let counter = |name: &str, value: &AtomicU64| {
            (name.to_string(), value.load(Ordering::Relaxed).to_string())
        };

        vec![
            ("uptime".to_string(), self.uptime_secs().to_string()),
            ("time".to_string(), now.to_string()),
            ("version".to_string(), crate::VERSION.to_string()),
            counter("curr_connections", &self.active_connections),
            counter("total_connections", &self.connections_accepted),
            counter("cmd_get", &self.cmd_get),
            counter("cmd_set", &self.cmd_set),
            counter("get_hits", &self.get_hits),
            counter("get_misses", &self.get_misses),
            counter("errors", &self.errors),
            counter("items_enqueued", &self.items_enqueued),
            counter("items_dequeued", &self.items_dequeued),
            counter("bytes_read", &self.bytes_read),
            counter("bytes_written", &self.bytes_written),
        ]
    }
}
