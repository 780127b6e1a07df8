//! Server configuration.

use crate::protocol::parser::MAX_NESTING_DEPTH;
use std::time::Duration;

/// Default cap on buffered request framing per connection (64 KB).
/// Bulk string payloads are limited separately by
/// [`MAX_BULK_SIZE`](crate::protocol::parser::MAX_BULK_SIZE).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Settings for one server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Close a connection after this long without receiving bytes
    pub idle_timeout: Option<Duration>,
    /// Close a connection whose undecoded input, not counting bulk string
    /// payloads, grows past this many bytes
    pub max_buffer_size: usize,
    /// Deepest array nesting accepted from clients
    pub max_nesting_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            idle_timeout: None,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_nesting_depth: MAX_NESTING_DEPTH,
        }
    }
}

impl ServerConfig {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
