//! Signaling relay binary entry point
//!
//! # Usage
//!
//! ```bash
//! cargo run -p securedrop-signaling-server -- --bind 0.0.0.0:4000
//! ```

use clap::Parser;
use securedrop_signaling_server::RelayServer;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// SecureDrop signaling relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:4000", env = "SECUREDROP_SIGNALING_BIND")]
    bind: SocketAddr,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false, env = "SECUREDROP_LOG_JSON")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting signaling relay on {}", args.bind);
    let server = RelayServer::bind(args.bind).await?;

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Ctrl+C received, shutting down");
        })
        .await;

    info!("Signaling relay shut down gracefully");
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
