//! proxy-relay binary.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::listener ──▶ ProxyServer ──▶ web pipeline ──▶ upstream
//!                  (TLS, h1/h2)        │             (delete_length, timeout,
//!                                      │              x_headers, stream)
//!                                      │
//!                                      └──▶ ws pipeline ──▶ tunnel ◀──▶ upstream
//!
//!     Cross-cutting: config (TOML), observability (tracing, metrics, events),
//!                    lifecycle (startup, signals, shutdown)
//! ```

use std::path::PathBuf;

use clap::Parser;

use proxy_relay::config::{load_config, validate_config, ServerConfig, Target};
use proxy_relay::lifecycle::{signals, startup};
use proxy_relay::observability::logging;

#[derive(Parser)]
#[command(name = "proxy-relay")]
#[command(about = "HTTP and WebSocket reverse proxy", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upstream URL; overrides the configured target.
    #[arg(short, long)]
    target: Option<String>,

    /// Port to listen on; overrides the configured port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Proxy WebSocket upgrades.
    #[arg(long)]
    ws: bool,

    /// Add x-forwarded-* headers.
    #[arg(long)]
    xfwd: bool,

    /// Log level used when RUST_LOG is not set.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) if cli.target.is_none() => load_config(path)?,
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<ServerConfig>(&content)?
        }
        None => ServerConfig::default(),
    };
    if let Some(target) = &cli.target {
        config.proxy.target = Some(target.parse::<Target>()?);
    }
    if let Some(port) = cli.port {
        config.listener.port = port;
    }
    if cli.ws {
        config.proxy.ws = Some(true);
    }
    if cli.xfwd {
        config.proxy.xfwd = Some(true);
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            eprintln!("invalid configuration: {}", error);
        }
        std::process::exit(2);
    }

    logging::init(&config.observability.log_level);
    tracing::info!("proxy-relay v{} starting", env!("CARGO_PKG_VERSION"));
    let server = startup::start(config).await?;

    signals::shutdown_signal().await;
    server.close().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
