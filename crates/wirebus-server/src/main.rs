//! wirebus server daemon.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port
//! wirebus-server
//!
//! # Custom port, verbose logging
//! wirebus-server --port 6000 --log-filter debug
//! ```
//!
//! Accepts clients until terminated. A default observer logs every received
//! chunk and acknowledges it with the fixed OK token; Ctrl-C requests
//! termination and closes the server cleanly.

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use wirebus_server::{DEFAULT_PORT, Server, ServerConfig, Subscription};

/// wirebus TCP server
#[derive(Parser, Debug)]
#[command(name = "wirebus-server")]
#[command(about = "Multi-client TCP server with observer-based event dispatch")]
#[command(version)]
struct Args {
    /// Port to listen on (bound on all interfaces)
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Accept backlog
    #[arg(long, default_value_t = 64)]
    backlog: u32,

    /// Keep disconnected clients in the collection instead of reaping them
    #[arg(long)]
    no_reap: bool,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_filter));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("wirebus server starting");

    let server = Server::new();
    server.subscribe(
        Subscription::any()
            .on_data(|ip, bytes| {
                tracing::info!("{} sent {} bytes", ip, bytes.len());
                true
            })
            .on_connection_data(|conn, _bytes| {
                conn.send_ok();
                true
            }),
    );

    let config =
        ServerConfig { port: args.port, backlog: args.backlog, auto_reap: !args.no_reap };
    server.start(&config).await?;

    let signal_target = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Termination signal received");
            signal_target.set_terminate(true);
            signal_target.close().await;
        }
    });

    while !server.should_terminate() {
        match server.accept_client(Duration::ZERO).await {
            Ok(ip) => {
                let live = server.connection_count().await;
                tracing::info!("Client {} connected ({} live)", ip, live);
            },
            Err(e) => {
                if server.should_terminate() {
                    break;
                }
                tracing::warn!("Accept failed: {}", e);
            },
        }
    }

    tracing::info!("wirebus server stopped");
    Ok(())
}
