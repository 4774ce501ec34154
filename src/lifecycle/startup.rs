//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize logging and metrics from configuration
//! - Build the proxy server from the configured defaults
//! - Bind the listener last, so traffic only arrives when ready
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - A bad metrics address is logged, not fatal

use crate::config::schema::ServerConfig;
use crate::error::ProxyError;
use crate::http::server::ProxyServer;
use crate::observability::{logging, metrics};

/// Bring up a listening proxy for `config`.
pub async fn start(config: ServerConfig) -> Result<ProxyServer, ProxyError> {
    logging::init(&config.observability.log_level);

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let target = config.proxy.target.as_ref().map(ToString::to_string);
    tracing::info!(
        target = target.as_deref().unwrap_or("-"),
        ws = config.proxy.ws_enabled(),
        xfwd = config.proxy.xfwd_enabled(),
        "Configuration loaded"
    );

    let server = ProxyServer::new(config.proxy);
    server
        .listen(config.listener.port, config.listener.hostname.as_deref())
        .await?;
    Ok(server)
}
