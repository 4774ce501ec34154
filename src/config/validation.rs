//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that a destination exists and is resolvable
//! - Validate value ranges (timeouts > 0, redirect limits)
//! - Check that listener TLS files are readable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function apart from TLS file existence checks

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::schema::{FollowRedirects, ServerConfig, Target};

/// Largest accepted `follow_redirects` hop count.
pub const MAX_REDIRECT_LIMIT: u32 = 50;

/// A semantic problem in a loaded configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("proxy needs a `target` or a `forward` destination")]
    MissingDestination,

    #[error("`{field}` has neither a host nor a socket path")]
    UnresolvableTarget { field: &'static str },

    #[error("`{0}` must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("`follow_redirects` allows at most {MAX_REDIRECT_LIMIT} hops, got {0}")]
    RedirectLimit(u32),

    #[error("cannot read listener TLS file {0}")]
    TlsFileUnreadable(PathBuf),

    #[error("invalid metrics address `{0}`")]
    MetricsAddress(String),
}

/// Check `config`, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let proxy = &config.proxy;

    if proxy.target.is_none() && proxy.forward.is_none() {
        errors.push(ValidationError::MissingDestination);
    }
    for (field, target) in [("target", &proxy.target), ("forward", &proxy.forward)] {
        if let Some(target) = target {
            if !is_resolvable(target) {
                errors.push(ValidationError::UnresolvableTarget { field });
            }
        }
    }

    if proxy.timeout == Some(0) {
        errors.push(ValidationError::ZeroTimeout("timeout"));
    }
    if proxy.proxy_timeout == Some(0) {
        errors.push(ValidationError::ZeroTimeout("proxy_timeout"));
    }
    if let Some(FollowRedirects::Limit(n)) = proxy.follow_redirects {
        if n > MAX_REDIRECT_LIMIT {
            errors.push(ValidationError::RedirectLimit(n));
        }
    }

    if let Some(ssl) = &proxy.ssl {
        for path in [&ssl.cert_path, &ssl.key_path] {
            if !path.is_file() {
                errors.push(ValidationError::TlsFileUnreadable(path.clone()));
            }
        }
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::MetricsAddress(observability.metrics_address.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_resolvable(target: &Target) -> bool {
    target.socket_path.is_some() || target.host.is_some() || target.hostname.is_some()
}
