//! Connection Handler Module
//!
//! One async task per client connection. Each task owns its socket, its read
//! buffer and its decoder; the only state shared between tasks is the storage
//! engine and the connection statistics.
//!
//! ## Features
//!
//! - **Pipelining**: Several requests in one TCP packet are answered in order
//! - **Partial reads**: A request split across packets is buffered until whole
//! - **Isolation**: A failing connection closes without affecting others
//! - **Statistics**: Tracks connection and command metrics
//!
//! ## Example
//!
//! ```ignore
//! use respkv::connection::{handle_connection, ConnectionStats};
//! use respkv::commands::CommandHandler;
//! use respkv::storage::StorageEngine;
//! use respkv::ServerConfig;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(StorageEngine::new());
//! let stats = Arc::new(ConnectionStats::new());
//! let config = Arc::new(ServerConfig::default());
//!
//! // For each accepted connection...
//! let (stream, addr) = listener.accept().await?;
//! let handler = CommandHandler::new(Arc::clone(&storage));
//! tokio::spawn(handle_connection(stream, addr, handler, Arc::clone(&stats), Arc::clone(&config)));
//! ```

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
