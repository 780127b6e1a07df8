//! Client Connection Handling
//!
//! Each accepted socket gets its own task running [`ConnectionHandler::run`]:
//!
//! ```text
//! 1. Read bytes into the buffer
//!        │
//!        ▼
//! 2. Decode every complete request in the buffer
//!        │
//!        ▼
//! 3. Execute each one and queue its reply
//!        │
//!        ▼
//! 4. Flush replies, go back to 1
//! ```
//!
//! TCP is a stream, so a read may deliver half a request or several
//! pipelined ones. The buffer keeps undecoded bytes between reads.
//!
//! A request that fails to decode ends the connection: after a protocol
//! error the position in the stream can't be trusted. Command errors are
//! ordinary replies and keep the connection open.

use crate::commands::{is_quit, CommandHandler};
use crate::config::ServerConfig;
use crate::protocol::parser::MAX_BULK_SIZE;
use crate::protocol::{ParseError, ParseOutcome, RespParser, RespValue};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Most spare capacity reserved ahead of a single read
const MAX_READ_RESERVE: usize = 64 * 1024;

/// Hard cap on one buffered request, payloads included (1 GB, same as Redis)
const MAX_REQUEST_SIZE: usize = 2 * MAX_BULK_SIZE;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed request
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    /// Client disconnected between requests
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Client disconnected in the middle of a request
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,

    /// Nothing received within the idle timeout
    #[error("Idle timeout after {0:?}")]
    IdleTimeout(Duration),
}

impl ConnectionError {
    /// True for endings a well-behaved client causes on its own.
    fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::ClientDisconnected | ConnectionError::UnexpectedEof => true,
            ConnectionError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Bytes received but not yet decoded
    buffer: BytesMut,

    command_handler: CommandHandler,

    parser: RespParser,

    /// Buffer length the pending request needs before it can decode
    needed: usize,

    /// Bulk payload bytes declared by the pending request
    payload: usize,

    stats: Arc<ConnectionStats>,

    max_buffer_size: usize,

    idle_timeout: Option<Duration>,
}

impl ConnectionHandler {
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - The TCP stream for this connection
    /// * `addr` - The client's socket address
    /// * `command_handler` - The command handler for executing commands
    /// * `stats` - Shared connection statistics
    /// * `config` - Limits applied to this connection
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
        config: &ServerConfig,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            command_handler,
            parser: RespParser::with_max_depth(config.max_nesting_depth),
            needed: 0,
            payload: 0,
            stats,
            max_buffer_size: config.max_buffer_size,
            idle_timeout: config.idle_timeout,
        }
    }

    /// Serves requests until the client disconnects, quits, or sends
    /// something undecodable.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(e) if e.is_disconnect() => debug!(client = %self.addr, error = %e, "Client disconnected"),
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        self.stats.connection_closed();
        result
    }

    /// The main read-execute-respond loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let mut quit = false;

            loop {
                let request = match self.try_parse_request() {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) => {
                        // Replies to the requests before the bad one still go out
                        self.stream.flush().await?;
                        return Err(e);
                    }
                };
                quit = is_quit(&request);

                let response = self.command_handler.execute(request);
                self.stats.command_processed();
                self.queue_response(&response).await?;

                if quit {
                    break;
                }
            }

            // One flush per batch of pipelined requests
            self.stream.flush().await?;

            if quit {
                return Ok(());
            }

            self.read_more_data().await?;
        }
    }

    /// Decodes one request from the front of the buffer, if a whole one is there.
    fn try_parse_request(&mut self) -> Result<Option<RespValue>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse_partial(&self.buffer) {
            Ok(ParseOutcome::Complete(value, consumed)) => {
                self.buffer.advance(consumed);
                self.needed = 0;
                self.payload = 0;
                trace!(
                    client = %self.addr,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed request"
                );
                Ok(Some(value))
            }
            Ok(ParseOutcome::Incomplete { needed, payload }) => {
                self.needed = needed;
                self.payload = payload;
                trace!(
                    client = %self.addr,
                    buffered = self.buffer.len(),
                    needed = needed,
                    "Incomplete request, need more data"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Parse error, closing connection");
                Err(ConnectionError::ParseError(e))
            }
        }
    }

    /// Reads more data from the socket into the buffer.
    ///
    /// `max_buffer_size` bounds the framing of the pending request. Bulk
    /// payloads it has declared may take the buffer past that, up to
    /// [`MAX_REQUEST_SIZE`].
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        let framing = self.buffer.len().saturating_sub(self.payload);
        if framing >= self.max_buffer_size || self.buffer.len() >= MAX_REQUEST_SIZE {
            error!(
                client = %self.addr,
                size = self.buffer.len(),
                payload = self.payload,
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        let spare = self.buffer.capacity() - self.buffer.len();
        let missing = self.needed.saturating_sub(self.buffer.len());
        if spare < 1024 || spare < missing.min(MAX_READ_RESERVE) {
            self.buffer.reserve(missing.clamp(4096, MAX_READ_RESERVE));
        }

        let read = self.stream.get_mut().read_buf(&mut self.buffer);
        let n = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| ConnectionError::IdleTimeout(limit))??,
            None => read.await?,
        };

        if n == 0 {
            return if self.buffer.is_empty() {
                Err(ConnectionError::ClientDisconnected)
            } else {
                // Stream ended inside a request
                Err(ConnectionError::UnexpectedEof)
            };
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");

        Ok(())
    }

    /// Writes a reply into the output buffer. Sent on the next flush.
    async fn queue_response(&mut self, response: &RespValue) -> Result<(), ConnectionError> {
        let bytes = response.serialize();
        self.stream.write_all(&bytes).await?;
        self.stats.bytes_written(bytes.len());
        trace!(
            client = %self.addr,
            bytes = bytes.len(),
            "Queued response"
        );
        Ok(())
    }
}

/// Runs a [`ConnectionHandler`] to completion.
///
/// Errors are already logged by the handler, so this swallows them; the
/// only effect of a failed connection is that its socket is closed.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    config: Arc<ServerConfig>,
) {
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats, &config);
    let _ = handler.run().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn create_test_server(
        config: ServerConfig,
    ) -> (SocketAddr, Arc<StorageEngine>, Arc<ConnectionStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let storage = Arc::new(StorageEngine::new());
        let stats = Arc::new(ConnectionStats::new());
        let config = Arc::new(config);

        let storage_clone = Arc::clone(&storage);
        let stats_clone = Arc::clone(&stats);

        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let handler = CommandHandler::new(Arc::clone(&storage_clone));
                let stats = Arc::clone(&stats_clone);
                tokio::spawn(handle_connection(
                    stream,
                    client_addr,
                    handler,
                    stats,
                    Arc::clone(&config),
                ));
            }
        });

        (addr, storage, stats)
    }

    /// Reads until `expected` bytes arrived or the peer closed.
    async fn read_exact_or_eof(client: &mut TcpStream, expected: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);

        while out.len() < expected && tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), client.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
                Ok(Err(_)) => break,
                Err(_) => continue,
            }
        }
        out
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (addr, _, _) = create_test_server(ServerConfig::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();

        assert_eq!(read_exact_or_eof(&mut client, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_set_get() {
        let (addr, storage, _) = create_test_server(ServerConfig::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\nAriz\r\n")
            .await
            .unwrap();
        assert_eq!(read_exact_or_eof(&mut client, 5).await, b"+OK\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .await
            .unwrap();
        assert_eq!(read_exact_or_eof(&mut client, 10).await, b"$4\r\nAriz\r\n");

        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_pipelined_and_split_requests() {
        let (addr, _, _) = create_test_server(ServerConfig::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // Two whole requests plus the first half of a third
        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n*2\r\n$4\r\nECHO\r\n$3\r\nh")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.write_all(b"ey\r\n").await.unwrap();

        let expected = b"+OK\r\n$2\r\nv1\r\n$3\r\nhey\r\n";
        assert_eq!(read_exact_or_eof(&mut client, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_command_error_keeps_connection() {
        let (addr, _, _) = create_test_server(ServerConfig::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*1\r\n$3\r\nFOO\r\n").await.unwrap();
        let expected = b"-ERR unknown command 'FOO'\r\n";
        assert_eq!(read_exact_or_eof(&mut client, expected.len()).await, expected);

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        assert_eq!(read_exact_or_eof(&mut client, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_protocol_error_closes_connection() {
        let (addr, storage, stats) = create_test_server(ServerConfig::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"!oops\r\n").await.unwrap();
        assert!(read_exact_or_eof(&mut client, 1).await.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        // Other connections and the table are unaffected
        let mut other = TcpStream::connect(addr).await.unwrap();
        other
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\nb\r\n")
            .await
            .unwrap();
        assert_eq!(read_exact_or_eof(&mut other, 5).await, b"+OK\r\n");
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_replies_before_protocol_error_are_sent() {
        let (addr, storage, _) = create_test_server(ServerConfig::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // A valid SET and garbage in the same segment
        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n!bad\r\n")
            .await
            .unwrap();

        // The OK arrives, then the connection closes
        assert_eq!(read_exact_or_eof(&mut client, 64).await, b"+OK\r\n");
        assert_eq!(storage.get(&Bytes::from("k")), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_value_larger_than_buffer_limit() {
        let (addr, _, stats) = create_test_server(ServerConfig::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let value = vec![b'x'; 100_000];
        let mut request =
            format!("*3\r\n$3\r\nSET\r\n$3\r\nbig\r\n${}\r\n", value.len()).into_bytes();
        request.extend_from_slice(&value);
        request.extend_from_slice(b"\r\n");

        // Split so the payload trails its header across several reads
        let (head, tail) = request.split_at(40_000);
        client.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(tail).await.unwrap();
        assert_eq!(read_exact_or_eof(&mut client, 5).await, b"+OK\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nbig\r\n")
            .await
            .unwrap();
        let mut expected = b"$100000\r\n".to_vec();
        expected.extend_from_slice(&value);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(read_exact_or_eof(&mut client, expected.len()).await, expected);

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_oversized_framing_closes_connection() {
        let config = ServerConfig {
            max_buffer_size: 1024,
            ..ServerConfig::default()
        };
        let (addr, _, stats) = create_test_server(config).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // A simple string line that never ends
        let mut junk = b"+".to_vec();
        junk.extend(std::iter::repeat(b'a').take(4096));
        let _ = client.write_all(&junk).await;

        assert!(read_exact_or_eof(&mut client, 1).await.is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_quit_closes_after_reply() {
        let (addr, _, _) = create_test_server(ServerConfig::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*1\r\n$4\r\nQUIT\r\n*1\r\n$4\r\nPING\r\n")
            .await
            .unwrap();

        // Only the QUIT reply arrives before the close
        assert_eq!(read_exact_or_eof(&mut client, 64).await, b"+OK\r\n");
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let config = ServerConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..ServerConfig::default()
        };
        let (addr, _, stats) = create_test_server(config).await;
        let _client = TcpStream::connect(addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let (addr, _, stats) = create_test_server(ServerConfig::default()).await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        let mut client = TcpStream::connect(addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let _ = read_exact_or_eof(&mut client, 7).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(stats.commands_processed.load(Ordering::Relaxed) >= 1);
        assert!(stats.bytes_read.load(Ordering::Relaxed) > 0);
        assert!(stats.bytes_written.load(Ordering::Relaxed) > 0);

        drop(client);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }
}
