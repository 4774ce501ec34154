//! Error types shared by every proxy flow.
//!
//! # Design Decisions
//! - One enum for the whole crate so pipeline passes, the transport and the
//!   facade can route failures through a single error dispatch
//! - `is_connection_reset` decides whether a failure becomes an
//!   `econnreset` event instead of a generic `error`

use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;

/// Errors surfaced by proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A target or address could not be resolved to host/port or socket path.
    #[error("invalid proxy address: {0}")]
    InvalidAddress(String),

    /// Neither `target` nor `forward` was configured.
    #[error("must provide a proper URL as target")]
    MissingTarget,

    /// `before`/`after` was called with an unknown pipeline name.
    #[error("pipeline type must be `web` or `ws`, got `{0}`")]
    InvalidPipelineType(String),

    /// `before`/`after` could not find the named pass.
    #[error("no such pass: `{0}`")]
    NoSuchPass(String),

    /// The inbound request could not be turned into an outbound one.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// A header name or value from configuration is not valid HTTP.
    #[error("invalid header `{0}`")]
    InvalidHeader(String),

    /// A socket was closed by the peer mid-exchange.
    #[error("socket hang up: {0}")]
    ConnectionReset(String),

    /// Connecting to the upstream failed.
    #[error("upstream connect error to {addr}: {source}")]
    UpstreamConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The upstream did not answer within `proxy_timeout`.
    #[error("upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    /// The upstream answered an upgrade request without switching protocols.
    #[error("upstream declined the upgrade with status {0}")]
    UpgradeDeclined(StatusCode),

    /// The inbound request is not a valid WebSocket upgrade.
    #[error("not a websocket upgrade request")]
    InvalidUpgrade,

    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// HTTP protocol error on the outbound connection.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// A request through a keep-alive agent failed.
    #[error("pooled upstream request failed: {0}")]
    Pool(#[from] hyper_util::client::legacy::Error),

    /// Socket level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether this failure means the connection was torn down underneath us.
    ///
    /// Outbound timeouts count as resets: the request is aborted and the
    /// socket destroyed.
    pub fn is_connection_reset(&self) -> bool {
        match self {
            ProxyError::ConnectionReset(_) | ProxyError::UpstreamTimeout(_) => true,
            ProxyError::Io(e) => is_reset_kind(e.kind()),
            ProxyError::UpstreamConnect { source, .. } => is_reset_kind(source.kind()),
            ProxyError::Http(e) => is_hyper_reset(e),
            ProxyError::Pool(e) => source_is_reset(e),
            _ => false,
        }
    }

    /// Short machine-friendly label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidAddress(_) => "invalid_address",
            ProxyError::MissingTarget => "missing_target",
            ProxyError::InvalidPipelineType(_) => "invalid_pipeline_type",
            ProxyError::NoSuchPass(_) => "no_such_pass",
            ProxyError::MalformedRequest(_) => "malformed_request",
            ProxyError::InvalidHeader(_) => "invalid_header",
            ProxyError::ConnectionReset(_) => "connection_reset",
            ProxyError::UpstreamConnect { .. } => "upstream_connect",
            ProxyError::UpstreamTimeout(_) => "upstream_timeout",
            ProxyError::UpgradeDeclined(_) => "upgrade_declined",
            ProxyError::InvalidUpgrade => "invalid_upgrade",
            ProxyError::Tls(_) => "tls",
            ProxyError::Http(_) => "http",
            ProxyError::Pool(e) if e.is_connect() => "upstream_connect",
            ProxyError::Pool(_) => "pool",
            ProxyError::Io(_) => "io",
        }
    }
}

impl From<std::convert::Infallible> for ProxyError {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

fn is_hyper_reset(e: &hyper::Error) -> bool {
    e.is_canceled() || e.is_incomplete_message() || e.is_closed()
}

/// Whether anything in the source chain of `error` is a reset.
fn source_is_reset(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = error.source();
    while let Some(cause) = current {
        if let Some(e) = cause.downcast_ref::<std::io::Error>() {
            if is_reset_kind(e.kind()) {
                return true;
            }
        } else if let Some(e) = cause.downcast_ref::<hyper::Error>() {
            if is_hyper_reset(e) {
                return true;
            }
        } else if let Some(e) = cause.downcast_ref::<ProxyError>() {
            if e.is_connection_reset() {
                return true;
            }
        }
        current = cause.source();
    }
    false
}

fn is_reset_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}
