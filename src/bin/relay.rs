//! Parley Relay Server
//!
//! A WebSocket store-and-forward relay. Mailboxes are keyed by recipient
//! identity and device and only ever hold sealed payloads; the relay never
//! sees plaintext or keys.
//!
//! Mailboxes live in memory and are lost on restart.
//!
//! Usage:
//!   parley-relay [--port 8765] [--host 0.0.0.0]

use std::sync::Arc;

use clap::Parser;
use parley::server::{websocket::serve_connection, MemoryRelay, RelayApi};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Parley Relay Server
#[derive(Parser)]
#[command(name = "parley-relay")]
#[command(about = "Store-and-forward WebSocket relay for Parley")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8765")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("Parley Relay listening on ws://{}", addr);

    let relay: Arc<dyn RelayApi> = Arc::new(MemoryRelay::new());
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(serve_connection(stream, peer, relay.clone()));
            }
            Err(e) => error!("Accept failed: {}", e),
        }
    }
}
