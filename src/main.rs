//! respkv server binary.
//!
//! Parses flags, sets up logging, and serves until Ctrl+C.

use clap::Parser;
use respkv::config::DEFAULT_MAX_BUFFER_SIZE;
use respkv::protocol::parser::MAX_NESTING_DEPTH;
use respkv::{Server, ServerConfig};
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// In-memory key-value cache with TTL, speaking RESP over TCP
#[derive(Parser, Debug)]
#[command(name = "respkv")]
#[command(version)]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = respkv::DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = respkv::DEFAULT_PORT)]
    port: u16,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long, default_value_t = 0)]
    idle_timeout_secs: u64,

    /// Deepest array nesting accepted in a request
    #[arg(long, default_value_t = MAX_NESTING_DEPTH)]
    max_depth: usize,

    /// Largest undecoded request buffer per connection, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_BUFFER_SIZE)]
    max_buffer: usize,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            host: args.host,
            port: args.port,
            idle_timeout: (args.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(args.idle_timeout_secs)),
            max_buffer_size: args.max_buffer,
            max_nesting_depth: args.max_depth,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = ServerConfig::from(args);
    info!(
        version = respkv::VERSION,
        addr = %config.bind_address(),
        idle_timeout = ?config.idle_timeout,
        max_depth = config.max_nesting_depth,
        "Starting respkv"
    );

    let server = Server::bind(config).await?;

    server
        .run(async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C, running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Server shutdown complete");
    Ok(())
}
