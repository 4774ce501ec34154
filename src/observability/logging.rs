//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Pick the level from `RUST_LOG`, falling back to configuration
//!
//! # Design Decisions
//! - Uses the tracing crate; every flow runs inside a span carrying `flow_id`
//! - Re-initialization is ignored so tests and embedders can call `init` freely

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `level` is a default directive such as `info` or `proxy_relay=debug`,
/// used only when `RUST_LOG` is not set.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

fn default_directive(level: &str) -> String {
    let level = level.trim();
    if level.is_empty() {
        "proxy_relay=info".to_string()
    } else if level.contains('=') {
        level.to_string()
    } else {
        format!("proxy_relay={},hyper=warn", level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive("debug"), "proxy_relay=debug,hyper=warn");
        assert_eq!(default_directive("hyper=trace"), "hyper=trace");
        assert_eq!(default_directive(""), "proxy_relay=info");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init("info");
        init("debug");
    }
}
