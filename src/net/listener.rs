//! Listening socket behind [`ProxyServer::listen`].
//!
//! # Responsibilities
//! - Bind the configured host/port and accept connections
//! - Optional TLS handshake, HTTP/1.1 or HTTP/2-with-fallback serving
//! - Tune accepted client sockets (no delay, keepalive)
//! - Route upgrade requests to `ws` when enabled, everything else to `web`
//! - Stop accepting on close and drain live connections
//!
//! # Design Decisions
//! - Each connection is one task; hyper drives it with upgrades enabled
//! - A flow that produced nothing for the client closes the connection
//!   without a response; no default error page is written
//! - Draining is bounded; connections still alive after the limit are left
//!   to finish on their own

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use crate::error::ProxyError;
use crate::http::body::ProxyBody;
use crate::http::request::ProxyRequest;
use crate::http::response::ServerResponse;
use crate::http::server::ProxyServer;
use crate::lifecycle::shutdown::Shutdown;
use crate::net::connection::{ConnectionGuard, ConnectionTracker};
use crate::net::socket::{self, ClientSocket, Io};
use crate::net::{tls, transport};

/// Upper bound on waiting for live connections during close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A running listener.
#[derive(Debug)]
pub(crate) struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: Shutdown,
    tracker: ConnectionTracker,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, ask live connections to finish, and wait for them.
    pub(crate) async fn close(self) {
        self.shutdown.trigger();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Accept loop ended abnormally");
        }
        if !self.tracker.wait_idle(DRAIN_TIMEOUT).await {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Connections still open after drain timeout"
            );
        }
        tracing::info!(address = %self.local_addr, "Listener closed");
    }
}

/// Per-listener serving settings.
struct Serving {
    server: ProxyServer,
    acceptor: Option<TlsAcceptor>,
    http2: bool,
    preserve_header_case: bool,
    ws: bool,
    tracker: ConnectionTracker,
}

/// Bind `hostname:port` (all interfaces by default) and start accepting.
pub(crate) async fn bind(server: ProxyServer, port: u16, hostname: Option<&str>) -> Result<ListenerHandle, ProxyError> {
    let options = server.options();
    let http2 = options.http2.unwrap_or(false);
    let acceptor = match &options.ssl {
        Some(ssl) => Some(tls::load_acceptor(ssl, http2)?),
        None => None,
    };

    let host = hostname.unwrap_or("0.0.0.0");
    let listener = TcpListener::bind((host, port)).await?;
    let local_addr = listener.local_addr()?;

    let tracker = ConnectionTracker::new();
    let serving = Arc::new(Serving {
        ws: options.ws_enabled(),
        preserve_header_case: options.preserves_header_case(),
        server,
        acceptor,
        http2,
        tracker: tracker.clone(),
    });

    tracing::info!(
        address = %local_addr,
        tls = serving.acceptor.is_some(),
        http2,
        ws = serving.ws,
        "Proxy listening"
    );

    let shutdown = Shutdown::new();
    let task = tokio::spawn(accept_loop(listener, serving, shutdown.clone()));
    Ok(ListenerHandle {
        local_addr,
        shutdown,
        tracker,
        task,
    })
}

async fn accept_loop(listener: TcpListener, serving: Arc<Serving>, shutdown: Shutdown) {
    let mut stop = shutdown.subscribe();
    loop {
        let accepted = tokio::select! {
            accepted = accept(&listener) => accepted,
            _ = stop.recv() => break,
        };
        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let guard = serving.tracker.track();
        let span = tracing::debug_span!("connection", id = %guard.id(), peer = %remote);
        let serving = Arc::clone(&serving);
        let stop = shutdown.subscribe();
        tokio::spawn(serve_connection(stream, remote, serving, stop, guard).instrument(span));
    }
    tracing::debug!("Accept loop stopped");
}

/// Accept one client and apply the tunnel socket options to it.
async fn accept(listener: &TcpListener) -> std::io::Result<(TcpStream, SocketAddr)> {
    let (stream, remote) = listener.accept().await?;
    socket::tune(&stream);
    Ok((stream, remote))
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    serving: Arc<Serving>,
    stop: broadcast::Receiver<()>,
    _guard: ConnectionGuard,
) {
    tracing::debug!("Connection accepted");
    match &serving.acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => serve_io(tls_stream, remote, true, &serving, stop).await,
            Err(e) => tracing::debug!(error = %e, "TLS handshake failed"),
        },
        None => serve_io(stream, remote, false, &serving, stop).await,
    }
}

/// Drive `$conn` to completion, switching to graceful shutdown on `$stop`.
macro_rules! drive {
    ($conn:expr, $stop:expr) => {{
        let conn = $conn;
        tokio::pin!(conn);
        let mut draining = false;
        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "Connection ended with error");
                    }
                    break;
                }
                _ = $stop.recv(), if !draining => {
                    draining = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    }};
}

async fn serve_io<S: Io>(
    stream: S,
    remote: SocketAddr,
    encrypted: bool,
    serving: &Serving,
    mut stop: broadcast::Receiver<()>,
) {
    let server = serving.server.clone();
    let ws = serving.ws;
    let service = service_fn(move |req: Request<Incoming>| dispatch(server.clone(), req, remote, encrypted, ws));
    let io = TokioIo::new(stream);

    if serving.http2 {
        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder.http1().preserve_header_case(serving.preserve_header_case);
        drive!(builder.serve_connection_with_upgrades(io, service), stop);
    } else {
        let mut builder = http1::Builder::new();
        builder.preserve_header_case(serving.preserve_header_case);
        drive!(builder.serve_connection(io, service).with_upgrades(), stop);
    }
}

async fn dispatch(
    server: ProxyServer,
    mut req: Request<Incoming>,
    remote: SocketAddr,
    encrypted: bool,
    ws: bool,
) -> Result<Response<ProxyBody>, ProxyError> {
    if ws && transport::is_upgrade_request(&req) {
        let (mut socket, pending) = ClientSocket::upgradable(&mut req);
        let mut request = ProxyRequest::new(req).with_remote_addr(remote).with_encrypted(encrypted);
        tokio::spawn(
            async move {
                if let Err(e) = server.ws(&mut request, &mut socket, None, Bytes::new()).await {
                    tracing::warn!(error = %e, "Upgrade flow failed");
                }
            }
            .in_current_span(),
        );
        return pending
            .response()
            .await
            .ok_or_else(|| ProxyError::ConnectionReset("client socket destroyed".to_string()));
    }

    let mut request = ProxyRequest::new(req).with_remote_addr(remote).with_encrypted(encrypted);
    let mut res = ServerResponse::new();
    let result = server.web(&mut request, &mut res, None).await;
    if let Err(e) = &result {
        tracing::warn!(error = %e, "Proxy flow failed");
    }
    if request.socket().is_destroyed() {
        return Err(ProxyError::ConnectionReset("client socket destroyed".to_string()));
    }
    if res.is_touched() {
        return Ok(res.into_response());
    }
    Err(result
        .err()
        .unwrap_or_else(|| ProxyError::ConnectionReset("flow produced no response".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ProxyOptions;

    #[tokio::test]
    async fn test_accepted_socket_is_tuned() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();

        let (stream, remote) = accept(&listener).await.unwrap();
        assert!(remote.ip().is_loopback());
        assert!(stream.nodelay().unwrap());
        assert!(socket2::SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_bind_and_close() {
        let server = ProxyServer::new(ProxyOptions::for_target("http://127.0.0.1:1").unwrap());
        let handle = bind(server, 0, Some("127.0.0.1")).await.unwrap();
        let addr = handle.local_addr();
        assert_ne!(addr.port(), 0);

        handle.close().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
