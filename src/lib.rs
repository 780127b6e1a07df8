//! # respkv - A Small In-Memory Key-Value Cache with TTL
//!
//! respkv is a single-node, ephemeral key-value store spoken to over TCP in a
//! RESP-style wire protocol. Values are byte strings; any key may carry a
//! time-to-live after which it reads as absent.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                              respkv                               │
//! │                                                                   │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐            │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │            │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │            │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘            │
//! │                            │                  │                   │
//! │                            ▼                  ▼                   │
//! │                     ┌─────────────┐   ┌──────────────────────┐    │
//! │                     │   RESP      │   │    StorageEngine     │    │
//! │                     │   Codec     │   │  64 RwLock shards    │    │
//! │                     └─────────────┘   └──────────────────────┘    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per request: bytes → [`RespParser`] → [`CommandHandler`] →
//! [`StorageEngine`] → [`RespValue::serialize`] → socket.
//!
//! ## Quick Start
//!
//! ```no_run
//! use respkv::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     server.run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `PING [message]`, `ECHO message`
//! - `SET key value [PX milliseconds]`, `GET key`
//! - `DEL key [key ...]`, `EXISTS key [key ...]`, `DBSIZE`
//! - `QUIT`
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP decoder and value types
//! - [`storage`]: Thread-safe storage engine with lazy TTL expiry
//! - [`commands`]: Command dispatch
//! - [`connection`]: Per-client connection loop
//! - [`server`]: Listener and accept loop

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod storage;

pub use commands::{CommandError, CommandHandler};
pub use config::ServerConfig;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{ParseError, RespParser, RespValue};
pub use server::Server;
pub use storage::StorageEngine;

/// The default port (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host to bind to
pub const DEFAULT_HOST: &str = "127.0.0.1";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
