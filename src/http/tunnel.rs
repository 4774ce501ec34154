//! Upgrade handshake and bidirectional piping.
//!
//! # Data Flow
//! ```text
//! outbound upgrade request
//!     → transport::send (raced against the client going away)
//!     → 101: hyper::upgrade::on → client gets "101 Switching Protocols"
//!            → pipe: client ⇄ upstream until both sides end
//!     → other status: relayed verbatim to the client socket
//! ```
//!
//! # Design Decisions
//! - Bytes the upstream sent right after its 101 are kept by hyper's
//!   `Upgraded`; bytes the client sent early are re-injected by the socket
//! - When the upstream ends, the client write side is shut down; when the
//!   client ends, the upstream write side is shut down

use std::io;

use bytes::Bytes;
use hyper::{HeaderMap, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::error::ProxyError;
use crate::http::body::ProxyBody;
use crate::http::outgoing::OutgoingRequest;
use crate::net::socket::{ClientSocket, Io};
use crate::net::transport;

/// The upstream side of an established tunnel.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    /// `host:port` or `unix:/path` of the upstream.
    pub endpoint: String,
    pub status: StatusCode,
    /// Headers of the upstream's 101 response.
    pub headers: HeaderMap,
}

/// Outcome of an upgrade handshake.
pub(crate) enum Handshake {
    Upgraded {
        info: TunnelInfo,
        client: Box<dyn Io>,
        upstream: Box<dyn Io>,
    },
    /// The upstream answered without switching protocols; its response was
    /// relayed to the client.
    Declined(StatusCode),
}

/// Send `request` upstream and complete the upgrade on both sides.
pub(crate) async fn handshake(
    desc: &OutgoingRequest,
    request: Request<ProxyBody>,
    socket: &mut ClientSocket,
    head: Bytes,
) -> Result<Handshake, ProxyError> {
    let response = tokio::select! {
        response = transport::send(desc, request) => response?,
        _ = socket.closed() => {
            return Err(ProxyError::ConnectionReset(
                "client went away before the upstream answered".to_string(),
            ));
        }
    };

    let status = response.status();
    if status != StatusCode::SWITCHING_PROTOCOLS {
        tracing::debug!(endpoint = %desc.endpoint(), status = %status, "Upstream declined upgrade");
        socket.relay(response).await?;
        return Ok(Handshake::Declined(status));
    }

    let info = TunnelInfo {
        endpoint: desc.endpoint(),
        status,
        headers: response.headers().clone(),
    };
    let upstream: Box<dyn Io> = Box::new(TokioIo::new(hyper::upgrade::on(response).await?));
    let client = socket.switch_protocols(&info.headers, head).await?;

    tracing::debug!(endpoint = %info.endpoint, "Tunnel established");
    Ok(Handshake::Upgraded {
        info,
        client,
        upstream,
    })
}

/// Bytes moved through a finished tunnel, per direction.
#[derive(Debug)]
pub struct PipeOutcome {
    pub to_upstream: io::Result<u64>,
    pub to_client: io::Result<u64>,
}

/// Copy bytes both ways until both directions end.
///
/// `on_upstream_end` runs as soon as the upstream stops sending.
pub(crate) async fn pipe(
    client: Box<dyn Io>,
    upstream: Box<dyn Io>,
    on_upstream_end: impl FnOnce() + Send,
) -> PipeOutcome {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let outbound = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        copied
    });

    let to_client = tokio::io::copy(&mut upstream_read, &mut client_write).await;
    let _ = client_write.shutdown().await;
    on_upstream_end();

    let to_upstream = match outbound.await {
        Ok(copied) => copied,
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
    };
    PipeOutcome {
        to_upstream,
        to_client,
    }
}

/// Byte counts of a closed tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelTraffic {
    pub to_upstream: u64,
    pub to_client: u64,
}

/// Handle to a tunnel piping in the background.
#[derive(Debug)]
pub struct Tunnel {
    info: TunnelInfo,
    task: JoinHandle<Result<TunnelTraffic, ProxyError>>,
}

impl Tunnel {
    /// Start piping `client` and `upstream` on a background task.
    pub(crate) fn spawn(info: TunnelInfo, client: Box<dyn Io>, upstream: Box<dyn Io>) -> Self {
        let endpoint = info.endpoint.clone();
        let task = tokio::spawn(async move {
            let outcome = pipe(client, upstream, || {}).await;
            tracing::debug!(endpoint = %endpoint, "Tunnel closed");
            let to_client = outcome.to_client?;
            Ok(TunnelTraffic {
                to_upstream: outcome.to_upstream.unwrap_or(0),
                to_client,
            })
        });
        Self { info, task }
    }

    pub fn info(&self) -> &TunnelInfo {
        &self.info
    }

    /// Wait for both directions to end.
    pub async fn join(self) -> Result<TunnelTraffic, ProxyError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ProxyError::Io(io::Error::new(io::ErrorKind::Other, e))),
        }
    }

    /// Tear the tunnel down without waiting.
    pub fn abort(&self) {
        self.task.abort();
    }
}
