//! Request and Reply Types
//!
//! This module defines the structured form of a parsed request line and the
//! replies the server writes back.
//!
//! ## Protocol Format
//!
//! Every request is a single `\r\n`-terminated ASCII line. A `set` line is
//! followed by exactly `<bytes>` payload bytes.
//!
//! ```text
//! set <queue> <flags> <exptime> <bytes>\r\n<payload>\r\n
//! get <queue>[/open][/close][/abort][/peek][/t=<ms>][ <ms>]\r\n
//! delete <queue>\r\n
//! flush <queue>\r\n
//! flush_all\r\n
//! stats\r\n
//! version\r\n
//! ```
//!
//! ## Replies
//!
//! - `STORED\r\n` after a successful `set`
//! - `VALUE <queue> 0 <bytes>\r\n<payload>\r\nEND\r\n` for a `get` hit
//! - `END\r\n` for an empty `get` and for `delete`/`flush`/`flush_all`
//! - `ERROR <msg>\r\n` for malformed client input
//! - `SERVER_ERROR <msg>\r\n` for internal failures

use std::fmt;
use std::time::Duration;

/// The line terminator used by the protocol
pub const CRLF: &[u8] = b"\r\n";

/// Modifiers of a `get` request.
///
/// Together they describe what happens to an item this connection fetched
/// earlier and whether (and how) a new item is fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Fetch an item and keep it pending until a later close or abort.
    pub open: bool,
    /// Permanently remove the pending item.
    pub close: bool,
    /// Return the pending item to the queue.
    pub abort: bool,
    /// Fetch an item without removing it.
    pub peek: bool,
    /// How long to wait for an item when the queue is empty.
    pub timeout: Option<Duration>,
}

impl GetOptions {
    /// Returns true if this request fetches a new item.
    ///
    /// A bare `get` fetches; `/close` or `/abort` on their own only resolve
    /// the pending item.
    pub fn fetches(&self) -> bool {
        self.open || self.peek || !(self.close || self.abort)
    }

    /// Returns the wait timeout, zero if none was given.
    pub fn wait(&self) -> Duration {
        self.timeout.unwrap_or(Duration::ZERO)
    }
}

/// A fully parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `stats`
    Stats,
    /// `version`
    Version,
    /// `delete <queue>`
    Delete { queue: String },
    /// `flush <queue>`
    Flush { queue: String },
    /// `flush_all [delay]`
    FlushAll,
    /// `set <queue> <flags> <exptime> <bytes>`
    ///
    /// `flags` and `exptime` are accepted for client compatibility and
    /// otherwise ignored.
    Set {
        queue: String,
        flags: u32,
        exptime: u64,
        bytes: u64,
    },
    /// `get <queue>[/options]`
    Get { queue: String, options: GetOptions },
}

impl Request {
    /// Returns the command name, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Stats => "stats",
            Request::Version => "version",
            Request::Delete { .. } => "delete",
            Request::Flush { .. } => "flush",
            Request::FlushAll => "flush_all",
            Request::Set { .. } => "set",
            Request::Get { .. } => "get",
        }
    }
}

/// A reply line (or block of lines) sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `END\r\n`
    End,
    /// `STORED\r\n`
    Stored,
    /// `VERSION <version>\r\n`
    Version(String),
    /// `STAT <name> <value>\r\n` lines followed by `END\r\n`
    Stats(Vec<(String, String)>),
    /// `VALUE <queue> 0 <bytes>\r\n`, the header preceding a payload
    Value { queue: String, bytes: u64 },
    /// `ERROR <msg>\r\n`
    Error(String),
    /// `SERVER_ERROR <msg>\r\n`
    ServerError(String),
}

impl Reply {
    /// Creates a client error reply.
    pub fn error(msg: impl Into<String>) -> Self {
        Reply::Error(msg.into())
    }

    /// Creates a server error reply.
    pub fn server_error(msg: impl Into<String>) -> Self {
        Reply::ServerError(msg.into())
    }

    /// Serializes the reply to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the reply into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::End => buf.extend_from_slice(b"END\r\n"),
            Reply::Stored => buf.extend_from_slice(b"STORED\r\n"),
            Reply::Version(v) => {
                buf.extend_from_slice(b"VERSION ");
                buf.extend_from_slice(v.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Stats(stats) => {
                for (name, value) in stats {
                    buf.extend_from_slice(b"STAT ");
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(b' ');
                    buf.extend_from_slice(value.as_bytes());
                    buf.extend_from_slice(CRLF);
                }
                buf.extend_from_slice(b"END\r\n");
            }
            Reply::Value { queue, bytes } => {
                buf.extend_from_slice(b"VALUE ");
                buf.extend_from_slice(queue.as_bytes());
                buf.extend_from_slice(b" 0 ");
                buf.extend_from_slice(bytes.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Error(msg) => {
                buf.extend_from_slice(b"ERROR ");
                buf.extend_from_slice(msg.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::ServerError(msg) => {
                buf.extend_from_slice(b"SERVER_ERROR ");
                buf.extend_from_slice(msg.as_bytes());
                buf.extend_from_slice(CRLF);
            }
        }
    }

    /// Returns true if this is a client or server error.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_) | Reply::ServerError(_))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::End => write!(f, "END"),
            Reply::Stored => write!(f, "STORED"),
            Reply::Version(v) => write!(f, "VERSION {}", v),
            Reply::Stats(stats) => write!(f, "({} stats)", stats.len()),
            Reply::Value { queue, bytes } => write!(f, "VALUE {} 0 {}", queue, bytes),
            Reply::Error(msg) => write!(f, "ERROR {}", msg),
            Reply::ServerError(msg) => write!(f, "SERVER_ERROR {}", msg),
        }
    }
}
