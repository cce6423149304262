//! Connection Handler Module
//!
//! This module handles individual client connections to spoolq.
//! Each client gets its own handler task that runs in a loop,
//! reading request lines, running one operation per request and
//! writing replies.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned
//!        │
//!        ▼
//! 3. ┌─────────────────────────────────────────────────────┐
//!    │  read_request ──> parse_request ──┬──> simple op    │
//!    │       ▲                           ├──> set loop     │
//!    │       │                           └──> get loop     │
//!    │       └─────────── reply ◄───────────────┘          │
//!    └─────────────────────────────────────────────────────┘
//!        │
//!        ▼
//! 4. Client disconnects / I/O error / server error
//!        │
//!        ▼
//! 5. Pending item returned to its queue, handler task ends
//! ```
//!
//! ## Streaming
//!
//! Payloads never sit in memory whole. A `set` moves at most `chunk_size`
//! bytes at a time from the socket into a [`PushStream`]; a `get` moves at
//! most `chunk_size` bytes at a time from an [`OpenItem`] to the socket.
//!
//! ## Failure Policy
//!
//! - Malformed request: `ERROR <msg>`, connection stays open
//! - Socket error or disconnect: no reply, in-flight push discarded,
//!   in-flight or pending fetch returned to its queue
//! - Store failure: logged, `SERVER_ERROR <msg>`, connection closed

use crate::commands::CommandHandler;
use crate::protocol::{GetOptions, Reply, Request, RequestParser, CRLF};
use crate::stats::Stats;
use crate::storage::{OpenItem, Queue, QueueDirectory, StorageError, StorageResult};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

/// Maximum length of a request line (64 KB)
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// What the dispatch loop does once an operation has replied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Go back to reading the next request line
    ReadRequest,
    /// Close the connection
    HangUp,
}

/// Handles a single client connection.
///
/// The handler owns the socket, the read buffer, a reusable outbound
/// buffer and at most one pending (fetched, unconfirmed) item.
pub struct ConnectionHandler<S> {
    /// The socket for this connection
    stream: BufWriter<S>,

    /// Connection id (for logging)
    id: u64,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Buffer for incoming data
    buffer: BytesMut,

    /// Reusable buffer for reply lines
    out: Vec<u8>,

    /// Reusable buffer for payload chunks read from the store
    chunk: Vec<u8>,

    /// Upper bound on bytes moved per I/O step
    chunk_size: usize,

    /// Request line parser
    parser: RequestParser,

    /// Executes the single-step commands
    commands: CommandHandler,

    /// Queue directory (shared)
    directory: Arc<QueueDirectory>,

    /// Server statistics (shared)
    stats: Arc<Stats>,

    /// Item fetched with `/open` and not yet closed or aborted
    pending: Option<OpenItem>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - The socket for this connection
    /// * `addr` - The client's socket address
    /// * `directory` - The shared queue directory
    /// * `stats` - Shared server statistics
    /// * `chunk_size` - Maximum bytes moved per I/O step; must be non-zero
    pub fn new(
        stream: S,
        addr: SocketAddr,
        directory: Arc<QueueDirectory>,
        stats: Arc<Stats>,
        chunk_size: usize,
    ) -> Self {
        let id = stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            id,
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            out: Vec::with_capacity(256),
            chunk: Vec::with_capacity(chunk_size),
            chunk_size: chunk_size.max(1),
            parser: RequestParser::new(),
            commands: CommandHandler::new(Arc::clone(&directory), Arc::clone(&stats)),
            directory,
            stats,
            pending: None,
        }
    }

    /// Runs the connection until the client disconnects or an error occurs.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(conn = self.id, client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(conn = self.id, client = %self.addr, "Connection closed by server"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(conn = self.id, client = %self.addr, "Client disconnected")
                }
                ConnectionError::IoError(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(conn = self.id, client = %self.addr, "Connection reset by client")
                }
                _ => warn!(conn = self.id, client = %self.addr, error = %e, "Connection error"),
            },
        }

        if let Some(item) = self.pending.take() {
            debug!(
                conn = self.id,
                queue = item.queue_name(),
                id = item.id(),
                "Returning unconfirmed item"
            );
            item.abort();
        }

        self.stats.connection_closed();
        result
    }

    /// The read-parse-dispatch loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let line = self.read_request().await?;

            // Blank lines carry no request; this also swallows the CRLF
            // that follows a set payload.
            if line.is_empty() {
                continue;
            }

            if self.parse_request(&line).await? == Flow::HangUp {
                return Ok(());
            }
        }
    }

    /// Reads from the socket until a full line is buffered and returns it
    /// without its terminator.
    async fn read_request(&mut self) -> Result<BytesMut, ConnectionError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                trace!(conn = self.id, len = line.len(), "Read request line");
                return Ok(line);
            }

            if self.buffer.len() >= MAX_LINE_LENGTH {
                warn!(conn = self.id, size = self.buffer.len(), "Request line too long");
                self.client_error("line too long").await?;
                return Err(ConnectionError::LineTooLong);
            }

            if self.buffer.capacity() - self.buffer.len() < 1024 {
                self.buffer.reserve(INITIAL_BUFFER_SIZE);
            }

            let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;
            if n == 0 {
                return if self.buffer.is_empty() {
                    Err(ConnectionError::ClientDisconnected)
                } else {
                    Err(ConnectionError::UnexpectedEof)
                };
            }
            self.stats.bytes_read(n);
        }
    }

    /// Parses one line and routes it to exactly one operation.
    async fn parse_request(&mut self, line: &[u8]) -> Result<Flow, ConnectionError> {
        let request = match self.parser.parse(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(conn = self.id, error = %e, "Parse error");
                return self.client_error(&e.to_string()).await;
            }
        };

        let op = request.name();
        trace!(conn = self.id, op, "Dispatching request");

        let outcome = match request {
            Request::Set { queue, bytes, .. } => return self.set(&queue, bytes).await,
            Request::Get { queue, options } => return self.get(&queue, options).await,
            Request::Stats => self.commands.cmd_stats().await,
            Request::Version => Ok(self.commands.cmd_version()),
            Request::Delete { queue } => self.commands.cmd_delete(&queue).await,
            Request::Flush { queue } => self.commands.cmd_flush(&queue).await,
            Request::FlushAll => self.commands.cmd_flush_all().await,
        };

        match outcome {
            Ok(reply) => {
                if reply.is_error() {
                    self.stats.error();
                }
                self.reply(&reply).await
            }
            Err(e) => self.server_error(op, &e).await,
        }
    }

    /// `set`: streams `bytes` payload bytes from the socket into the queue.
    async fn set(&mut self, name: &str, bytes: u64) -> Result<Flow, ConnectionError> {
        self.stats.cmd_set();

        let queue = match self.directory.get_or_create(name).await {
            Ok(queue) => queue,
            Err(e) => return self.server_error("set", &e).await,
        };
        let mut push = match queue.begin_push(bytes).await {
            Ok(push) => push,
            Err(e) => return self.server_error("set", &e).await,
        };

        // A socket error returns early and drops `push`, discarding the
        // partial item.
        while push.remaining() > 0 {
            if self.buffer.is_empty() {
                self.read_chunk().await?;
            }

            let n = (push.remaining().min(self.chunk_size as u64) as usize).min(self.buffer.len());
            let chunk = self.buffer.split_to(n);
            if let Err(e) = push.write(&chunk).await {
                drop(push);
                return self.server_error("set", &e).await;
            }
            trace!(conn = self.id, queue = name, chunk = n, remaining = push.remaining(), "Set chunk");
        }

        match push.commit().await {
            Ok(id) => {
                self.stats.item_enqueued();
                debug!(conn = self.id, queue = name, id, bytes, "Item stored");
                self.reply(&Reply::Stored).await
            }
            Err(e) => self.server_error("set", &e).await,
        }
    }

    /// `get`: resolves the pending item as requested, then fetches the next
    /// item and streams it to the socket.
    async fn get(&mut self, name: &str, options: GetOptions) -> Result<Flow, ConnectionError> {
        self.stats.cmd_get();

        // Resolve the pending item if this request targets its queue.
        let owns_pending = self
            .pending
            .as_ref()
            .is_some_and(|item| item.queue_name() == name);
        if owns_pending && (options.close || options.abort) {
            if let Some(item) = self.pending.take() {
                if options.close {
                    if let Err(e) = item.close().await {
                        return self.server_error("get", &e).await;
                    }
                    self.stats.item_dequeued();
                } else {
                    item.abort();
                }
            }
        }

        if !options.fetches() {
            return self.reply(&Reply::End).await;
        }
        if self.pending.is_some() {
            return self.client_error("close current item first").await;
        }

        let queue = match self.directory.get_or_create(name).await {
            Ok(queue) => queue,
            Err(e) => return self.server_error("get", &e).await,
        };
        let mut item = match self.wait_for_item(&queue, options).await? {
            Ok(Some(item)) => item,
            Ok(None) => {
                self.stats.get_miss();
                return self.reply(&Reply::End).await;
            }
            Err(e) => return self.server_error("get", &e).await,
        };
        self.stats.get_hit();

        self.out.clear();
        Reply::Value {
            queue: name.to_string(),
            bytes: item.size(),
        }
        .serialize_into(&mut self.out);
        self.stream.write_all(&self.out).await?;
        self.stats.bytes_written(self.out.len());

        // A socket error returns early and drops `item`, which returns it
        // to the queue.
        loop {
            let n = match item.read_chunk(&mut self.chunk, self.chunk_size).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    drop(item);
                    return self.server_error("get", &e).await;
                }
            };
            self.stream.write_all(&self.chunk[..n]).await?;
            self.stats.bytes_written(n);
            trace!(conn = self.id, queue = name, chunk = n, remaining = item.remaining(), "Get chunk");
        }

        self.stream.write_all(CRLF).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(CRLF.len());

        if options.open {
            trace!(conn = self.id, queue = name, id = item.id(), "Item left open");
            self.pending = Some(item);
        } else if options.peek {
            item.abort();
        } else {
            if let Err(e) = item.close().await {
                return self.server_error("get", &e).await;
            }
            self.stats.item_dequeued();
        }

        self.reply(&Reply::End).await
    }

    /// Waits for an item while watching the socket.
    ///
    /// A client that goes away while waiting ends the wait before an item
    /// is taken. Bytes that arrive meanwhile stay in the read buffer.
    async fn wait_for_item(
        &mut self,
        queue: &Arc<Queue>,
        options: GetOptions,
    ) -> Result<StorageResult<Option<OpenItem>>, ConnectionError> {
        let pop = queue.pop_open(options.wait());
        tokio::pin!(pop);

        loop {
            let watch = self.buffer.len() < MAX_LINE_LENGTH;
            if watch && self.buffer.capacity() - self.buffer.len() < 1024 {
                self.buffer.reserve(INITIAL_BUFFER_SIZE);
            }

            tokio::select! {
                biased;
                popped = &mut pop => return Ok(popped),
                read = self.stream.get_mut().read_buf(&mut self.buffer), if watch => match read? {
                    0 => {
                        debug!(conn = self.id, queue = queue.name(), "Client left while waiting");
                        return Err(ConnectionError::ClientDisconnected);
                    }
                    n => self.stats.bytes_read(n),
                },
            }
        }
    }

    /// Reads at most one chunk from the socket into the buffer.
    async fn read_chunk(&mut self) -> Result<(), ConnectionError> {
        self.buffer.reserve(self.chunk_size);
        let mut limited = (&mut self.buffer).limit(self.chunk_size);
        let n = self.stream.get_mut().read_buf(&mut limited).await?;
        if n == 0 {
            return Err(ConnectionError::UnexpectedEof);
        }
        self.stats.bytes_read(n);
        Ok(())
    }

    /// Sends a reply and goes back to reading requests.
    async fn reply(&mut self, reply: &Reply) -> Result<Flow, ConnectionError> {
        self.out.clear();
        reply.serialize_into(&mut self.out);
        self.write_out().await?;
        trace!(conn = self.id, reply = %reply, "Sent reply");
        Ok(Flow::ReadRequest)
    }

    /// Replies `ERROR <msg>`; the connection stays open.
    async fn client_error(&mut self, msg: &str) -> Result<Flow, ConnectionError> {
        self.stats.error();
        self.reply(&Reply::error(msg)).await
    }

    /// Logs a store failure, replies `SERVER_ERROR <msg>` and hangs up.
    async fn server_error(&mut self, op: &str, e: &StorageError) -> Result<Flow, ConnectionError> {
        error!(conn = self.id, client = %self.addr, op, error = %e, "Server error");
        self.stats.error();

        self.out.clear();
        Reply::server_error(e.to_string()).serialize_into(&mut self.out);
        if let Err(write_err) = self.write_out().await {
            debug!(conn = self.id, error = %write_err, "Failed to send server error");
        }
        Ok(Flow::HangUp)
    }

    /// Writes and flushes the outbound buffer.
    async fn write_out(&mut self) -> Result<(), ConnectionError> {
        self.stream.write_all(&self.out).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(self.out.len());
        Ok(())
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Client disconnected between requests
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial line or payload)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// A request line exceeded `MAX_LINE_LENGTH`
    #[error("Request line too long")]
    LineTooLong,
}

/// Handles a client connection.
///
/// This is a convenience function that creates a ConnectionHandler
/// and runs it to completion.
///
/// # Arguments
///
/// * `stream` - The TCP stream for this connection
/// * `addr` - The client's socket address
/// * `directory` - The shared queue directory
/// * `stats` - Shared server statistics
/// * `chunk_size` - Maximum bytes moved per I/O step
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    directory: Arc<QueueDirectory>,
    stats: Arc<Stats>,
    chunk_size: usize,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let handler = ConnectionHandler::new(stream, addr, directory, stats, chunk_size);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    struct TestServer {
        addr: SocketAddr,
        directory: Arc<QueueDirectory>,
        stats: Arc<Stats>,
        tmp: TempDir,
    }

    async fn create_test_server(chunk_size: usize) -> TestServer {
        let tmp = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let directory = Arc::new(QueueDirectory::open(tmp.path()).await.unwrap());
        let stats = Arc::new(Stats::new());

        let directory_clone = Arc::clone(&directory);
        let stats_clone = Arc::clone(&stats);

        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let directory = Arc::clone(&directory_clone);
                let stats = Arc::clone(&stats_clone);
                tokio::spawn(handle_connection(
                    stream,
                    client_addr,
                    directory,
                    stats,
                    chunk_size,
                ));
            }
        });

        TestServer {
            addr,
            directory,
            stats,
            tmp,
        }
    }

    /// Reads exactly `expected.len()` bytes and compares them.
    async fn expect(client: &mut TcpStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .expect("timed out waiting for reply")
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&buf),
            String::from_utf8_lossy(expected)
        );
    }

    /// Reads until the reply ends with `END\r\n`.
    async fn read_until_end(client: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        while !out.ends_with(b"END\r\n") {
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .expect("timed out waiting for reply")
                .unwrap();
            assert!(n > 0, "connection closed before END");
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    /// Waits for the server to close the connection.
    async fn expect_closed(client: &mut TcpStream) {
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("timed out waiting for close")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    fn value_reply(queue: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = format!("VALUE {} 0 {}\r\n", queue, payload.len()).into_bytes();
        out.extend_from_slice(payload);
        out.extend_from_slice(b"\r\nEND\r\n");
        out
    }

    async fn set(client: &mut TcpStream, queue: &str, payload: &[u8]) {
        let mut req = format!("set {} 0 0 {}\r\n", queue, payload.len()).into_bytes();
        req.extend_from_slice(payload);
        req.extend_from_slice(b"\r\n");
        client.write_all(&req).await.unwrap();
        expect(client, b"STORED\r\n").await;
    }

    #[tokio::test]
    async fn test_version() {
        let server = create_test_server(1024).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"version\r\n").await.unwrap();
        expect(
            &mut client,
            format!("VERSION spoolq {}\r\n", crate::VERSION).as_bytes(),
        )
        .await;
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let server = create_test_server(1024).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"set q 0 0 5\r\nhello").await.unwrap();
        expect(&mut client, b"STORED\r\n").await;

        client.write_all(b"get q\r\n").await.unwrap();
        expect(&mut client, &value_reply("q", b"hello")).await;

        client.write_all(b"get q\r\n").await.unwrap();
        expect(&mut client, b"END\r\n").await;
    }

    #[tokio::test]
    async fn test_payload_sizes_across_chunks() {
        let server = create_test_server(4).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        let payloads: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"abc".to_vec(),
            b"abcd".to_vec(),
            (0..1000u32).map(|i| (i % 256) as u8).collect(),
        ];

        for payload in &payloads {
            set(&mut client, "sizes", payload).await;
        }
        assert_eq!(server.directory.get("sizes").await.unwrap().len(), 4);

        for payload in &payloads {
            client.write_all(b"get sizes\r\n").await.unwrap();
            expect(&mut client, &value_reply("sizes", payload)).await;
        }
    }

    #[tokio::test]
    async fn test_set_payload_split_across_writes() {
        let server = create_test_server(8).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"set q 0 0 11\r\nhello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b" world\r\nget q\r\n").await.unwrap();

        expect(&mut client, b"STORED\r\n").await;
        expect(&mut client, &value_reply("q", b"hello world")).await;
    }

    #[tokio::test]
    async fn test_open_item_returns_on_disconnect() {
        let server = create_test_server(1024).await;

        let mut first = TcpStream::connect(server.addr).await.unwrap();
        set(&mut first, "jobs", b"task").await;
        first.write_all(b"get jobs/open\r\n").await.unwrap();
        expect(&mut first, &value_reply("jobs", b"task")).await;

        let mut second = TcpStream::connect(server.addr).await.unwrap();
        second.write_all(b"get jobs\r\n").await.unwrap();
        expect(&mut second, b"END\r\n").await;

        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;

        second.write_all(b"get jobs\r\n").await.unwrap();
        expect(&mut second, &value_reply("jobs", b"task")).await;
    }

    #[tokio::test]
    async fn test_close_removes_item() {
        let server = create_test_server(1024).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        set(&mut client, "jobs", b"once").await;
        client.write_all(b"get jobs/open\r\n").await.unwrap();
        expect(&mut client, &value_reply("jobs", b"once")).await;

        client.write_all(b"get jobs/close\r\n").await.unwrap();
        expect(&mut client, b"END\r\n").await;
        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut other = TcpStream::connect(server.addr).await.unwrap();
        other.write_all(b"get jobs\r\n").await.unwrap();
        expect(&mut other, b"END\r\n").await;
        assert_eq!(server.stats.items_dequeued.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_abort_returns_item_to_head() {
        let server = create_test_server(1024).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        set(&mut client, "jobs", b"first").await;
        set(&mut client, "jobs", b"second").await;

        client.write_all(b"get jobs/open\r\n").await.unwrap();
        expect(&mut client, &value_reply("jobs", b"first")).await;

        client.write_all(b"get jobs/abort\r\n").await.unwrap();
        expect(&mut client, b"END\r\n").await;

        client.write_all(b"get jobs\r\n").await.unwrap();
        expect(&mut client, &value_reply("jobs", b"first")).await;
    }

    #[tokio::test]
    async fn test_second_open_requires_resolution() {
        let server = create_test_server(1024).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        set(&mut client, "jobs", b"a").await;
        set(&mut client, "jobs", b"b").await;

        client.write_all(b"get jobs/open\r\n").await.unwrap();
        expect(&mut client, &value_reply("jobs", b"a")).await;

        client.write_all(b"get jobs/open\r\n").await.unwrap();
        expect(&mut client, b"ERROR close current item first\r\n").await;

        client.write_all(b"get jobs\r\n").await.unwrap();
        expect(&mut client, b"ERROR close current item first\r\n").await;

        client.write_all(b"get jobs/close/open\r\n").await.unwrap();
        expect(&mut client, &value_reply("jobs", b"b")).await;

        let queue = server.directory.get("jobs").await.unwrap();
        assert_eq!(queue.stats().open, 1);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_close_without_pending_is_noop() {
        let server = create_test_server(1024).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        set(&mut client, "jobs", b"kept").await;
        client.write_all(b"get jobs/close\r\n").await.unwrap();
        expect(&mut client, b"END\r\n").await;
        client.write_all(b"get jobs/abort\r\n").await.unwrap();
        expect(&mut client, b"END\r\n").await;

        assert_eq!(server.directory.get("jobs").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_peek_leaves_item() {
        let server = create_test_server(1024).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        set(&mut client, "jobs", b"look").await;
        client.write_all(b"get jobs/peek\r\n").await.unwrap();
        expect(&mut client, &value_reply("jobs", b"look")).await;

        client.write_all(b"get jobs\r\n").await.unwrap();
        expect(&mut client, &value_reply("jobs", b"look")).await;
    }

    #[tokio::test]
    async fn test_malformed_lines_keep_connection() {
        let server = create_test_server(1024).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"bogus\r\n").await.unwrap();
        expect(&mut client, b"ERROR unknown command 'bogus'\r\n").await;

        client.write_all(b"set q 0 0\r\n").await.unwrap();
        expect(&mut client, b"ERROR wrong number of arguments for 'set'\r\n").await;

        client.write_all(b"get q/close/abort\r\n").await.unwrap();
        expect(&mut client, b"ERROR conflicting options: close and abort\r\n").await;

        set(&mut client, "q", b"still works").await;
        assert_eq!(server.stats.errors.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_disconnect_mid_set_discards_item() {
        let server = create_test_server(4).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"set q 0 0 100\r\npartial").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let queue = server.directory.get("q").await.unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.stats().pushing, 0);
        assert_eq!(std::fs::read_dir(queue.dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_during_set() {
        let server = create_test_server(4).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"set q 0 0 10\r\nhello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Pull the queue directory out from under the in-flight push
        std::fs::remove_dir_all(server.tmp.path().join("q")).unwrap();
        client.write_all(b"world\r\n").await.unwrap();

        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.starts_with(b"SERVER_ERROR "));

        let queue = server.directory.get("q").await.unwrap();
        assert!(queue.is_empty());
        assert_eq!(server.stats.items_enqueued.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_get_timeout_on_empty_queue() {
        let server = create_test_server(1024).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        let start = Instant::now();
        client.write_all(b"get empty_q 100\r\n").await.unwrap();
        expect(&mut client, b"END\r\n").await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_get_zero_timeout_returns_immediately() {
        let server = create_test_server(1024).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        let start = Instant::now();
        client.write_all(b"get empty_q/t=0\r\n").await.unwrap();
        expect(&mut client, b"END\r\n").await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_blocking_get_woken_by_set() {
        let server = create_test_server(1024).await;
        let mut consumer = TcpStream::connect(server.addr).await.unwrap();
        let mut producer = TcpStream::connect(server.addr).await.unwrap();

        consumer.write_all(b"get work/t=5000\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = Instant::now();
        set(&mut producer, "work", b"wake up").await;
        expect(&mut consumer, &value_reply("work", b"wake up")).await;
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    /// Polls until `check` holds or five seconds pass.
    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_waiting_consumer_disconnect_keeps_item() {
        let server = create_test_server(1024).await;

        let mut consumer = TcpStream::connect(server.addr).await.unwrap();
        consumer.write_all(b"get work/t=2000\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(consumer);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut producer = TcpStream::connect(server.addr).await.unwrap();
        set(&mut producer, "work", b"job").await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let queue = server.directory.get("work").await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().open, 0);
        assert_eq!(server.stats.items_dequeued.load(Ordering::Relaxed), 0);

        producer.write_all(b"get work\r\n").await.unwrap();
        expect(&mut producer, &value_reply("work", b"job")).await;
    }

    #[tokio::test]
    async fn test_waiting_get_keeps_pipelined_request() {
        let server = create_test_server(1024).await;
        let mut consumer = TcpStream::connect(server.addr).await.unwrap();
        let mut producer = TcpStream::connect(server.addr).await.unwrap();

        consumer.write_all(b"get work/t=5000\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        consumer.write_all(b"version\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        set(&mut producer, "work", b"job").await;
        expect(&mut consumer, &value_reply("work", b"job")).await;
        expect(
            &mut consumer,
            format!("VERSION spoolq {}\r\n", crate::VERSION).as_bytes(),
        )
        .await;
    }

    #[tokio::test]
    async fn test_disconnect_mid_get_returns_item() {
        let server = create_test_server(64 * 1024).await;

        let payload = vec![b'z'; 32 * 1024 * 1024];
        let mut producer = TcpStream::connect(server.addr).await.unwrap();
        set(&mut producer, "big", &payload).await;

        let mut consumer = TcpStream::connect(server.addr).await.unwrap();
        consumer.write_all(b"get big\r\n").await.unwrap();
        let mut partial = vec![0u8; 4096];
        consumer.read_exact(&mut partial).await.unwrap();
        assert!(partial.starts_with(b"VALUE big 0 33554432\r\n"));
        drop(consumer);

        let queue = server.directory.get("big").await.unwrap();
        assert!(eventually(|| queue.len() == 1 && queue.stats().open == 0).await);
        assert_eq!(server.stats.items_dequeued.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_delete_and_flush() {
        let server = create_test_server(1024).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        set(&mut client, "a", b"1").await;
        set(&mut client, "b", b"2").await;

        client.write_all(b"flush a\r\n").await.unwrap();
        expect(&mut client, b"END\r\n").await;
        client.write_all(b"get a\r\n").await.unwrap();
        expect(&mut client, b"END\r\n").await;

        client.write_all(b"delete b\r\n").await.unwrap();
        expect(&mut client, b"END\r\n").await;
        client.write_all(b"delete b\r\n").await.unwrap();
        expect(&mut client, b"ERROR unknown queue\r\n").await;

        set(&mut client, "c", b"3").await;
        client.write_all(b"flush_all\r\n").await.unwrap();
        expect(&mut client, b"END\r\n").await;
        client.write_all(b"get c\r\n").await.unwrap();
        expect(&mut client, b"END\r\n").await;
    }

    #[tokio::test]
    async fn test_stats_command() {
        let server = create_test_server(1024).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        set(&mut client, "jobs", b"x").await;
        client.write_all(b"stats\r\n").await.unwrap();
        let reply = String::from_utf8(read_until_end(&mut client).await).unwrap();

        assert!(reply.starts_with("STAT uptime "));
        assert!(reply.contains("STAT cmd_set 1\r\n"));
        assert!(reply.contains("STAT curr_connections 1\r\n"));
        assert!(reply.contains("STAT queue_jobs_items 1\r\n"));
        assert!(reply.ends_with("END\r\n"));
    }

    #[tokio::test]
    async fn test_line_too_long_closes_connection() {
        let server = create_test_server(1024).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        let line = vec![b'x'; MAX_LINE_LENGTH];
        client.write_all(&line).await.unwrap();
        expect(&mut client, b"ERROR line too long\r\n").await;
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let server = create_test_server(1024).await;
        let stats = &server.stats;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        let mut client = TcpStream::connect(server.addr).await.unwrap();

        // Give the server time to accept the connection
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);

        set(&mut client, "q", b"data").await;

        assert_eq!(stats.cmd_set.load(Ordering::Relaxed), 1);
        assert!(stats.bytes_read.load(Ordering::Relaxed) > 0);
        assert!(stats.bytes_written.load(Ordering::Relaxed) > 0);

        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_scripted_socket() {
        let tmp = TempDir::new().unwrap();
        let directory = Arc::new(QueueDirectory::open(tmp.path()).await.unwrap());
        let stats = Arc::new(Stats::new());

        let version = format!("VERSION spoolq {}\r\n", crate::VERSION);
        let stream = tokio_test::io::Builder::new()
            .read(b"version\r\n")
            .write(version.as_bytes())
            .read(b"set q 0 0 2\r\nhi\r\n")
            .write(b"STORED\r\n")
            .build();

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let handler = ConnectionHandler::new(stream, addr, Arc::clone(&directory), stats, 1024);
        let result = handler.run().await;

        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
        assert_eq!(directory.get("q").await.unwrap().len(), 1);
    }
}
