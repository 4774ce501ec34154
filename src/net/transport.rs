//! Outbound transport.
//!
//! # Data Flow
//! ```text
//! OutgoingRequest
//!     ├─ Agent (keep-alive, non-upgrade): pooled hyper-util client per endpoint
//!     │      → Connector → connect
//!     └─ otherwise: connect → hyper http1 handshake (upgrades enabled)
//!
//! connect: unix socket | TCP (optional local bind) → TLS when https/wss
//! ```
//!
//! # Design Decisions
//! - The scheme picks the transport per call, there is no global registry
//! - One connection per request unless an [`Agent`] is configured
//! - Upgrade requests never share or return pooled connections
//! - An agent keeps one pooled client per endpoint; TLS material and local
//!   address are taken from the first request to that endpoint

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{CONNECTION, UPGRADE};
use hyper::http::uri::{Authority, Scheme};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::net::{TcpSocket, TcpStream};

use crate::error::ProxyError;
use crate::http::body::ProxyBody;
use crate::http::outgoing::OutgoingRequest;
use crate::net::socket::{self, Io};
use crate::net::tls;

const DEFAULT_MAX_IDLE_PER_HOST: usize = 16;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Authority of pooled request URIs; the connector ignores it.
const POOL_AUTHORITY: &str = "upstream.pool";

/// Keep-alive pool of outbound HTTP/1.1 connections, keyed by endpoint.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    clients: DashMap<String, Client<Connector, ProxyBody>>,
    max_idle_per_host: usize,
    idle_timeout: Duration,
}

impl Agent {
    pub fn new() -> Self {
        Self::with_pool(DEFAULT_MAX_IDLE_PER_HOST, DEFAULT_IDLE_TIMEOUT)
    }

    /// Pool keeping at most `max_idle_per_host` connections per endpoint,
    /// each closed after `idle_timeout` without use.
    pub fn with_pool(max_idle_per_host: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                clients: DashMap::new(),
                max_idle_per_host,
                idle_timeout,
            }),
        }
    }

    /// Endpoints this agent has pooled clients for.
    pub fn endpoints(&self) -> usize {
        self.inner.clients.len()
    }

    fn client_for(&self, desc: &OutgoingRequest) -> Client<Connector, ProxyBody> {
        let key = pool_key(desc);
        if let Some(client) = self.inner.clients.get(&key) {
            return client.value().clone();
        }
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(self.inner.idle_timeout)
            .pool_max_idle_per_host(self.inner.max_idle_per_host)
            .pool_timer(TokioTimer::new())
            .http1_preserve_header_case(desc.preserve_header_case)
            .set_host(false)
            .build(Connector::new(desc));
        tracing::debug!(
            endpoint = %desc.endpoint(),
            max_idle = self.inner.max_idle_per_host,
            idle_timeout = ?self.inner.idle_timeout,
            "Connection pool created"
        );
        self.inner.clients.entry(key).or_insert(client).value().clone()
    }

    async fn send(
        &self,
        desc: &OutgoingRequest,
        mut request: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, ProxyError> {
        let mut parts = request.uri().clone().into_parts();
        parts.scheme = Some(Scheme::HTTP);
        parts.authority = Some(Authority::from_static(POOL_AUTHORITY));
        *request.uri_mut() = Uri::from_parts(parts)
            .map_err(|e| ProxyError::MalformedRequest(format!("{}: {}", desc.path, e)))?;

        let client = self.client_for(desc);
        Ok(client.request(request).await?)
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("max_idle_per_host", &self.inner.max_idle_per_host)
            .field("idle_timeout", &self.inner.idle_timeout)
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

fn pool_key(desc: &OutgoingRequest) -> String {
    format!(
        "{}//{}|{}|{:?}|{:?}|{}",
        desc.protocol,
        desc.endpoint(),
        desc.tls.servername.as_deref().unwrap_or(""),
        desc.local_address,
        desc.reject_unauthorized,
        desc.preserve_header_case,
    )
}

/// Connects pooled clients to one endpoint.
#[derive(Clone)]
struct Connector {
    desc: Arc<OutgoingRequest>,
}

impl Connector {
    fn new(desc: &OutgoingRequest) -> Self {
        let mut desc = desc.clone();
        desc.agent = None;
        desc.headers.clear();
        Self { desc: Arc::new(desc) }
    }
}

impl tower::Service<Uri> for Connector {
    type Response = PooledStream;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<PooledStream, ProxyError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let desc = Arc::clone(&self.desc);
        Box::pin(async move {
            let io = connect(&desc, false).await?;
            Ok(PooledStream(TokioIo::new(io)))
        })
    }
}

/// A pooled upstream connection.
struct PooledStream(TokioIo<Box<dyn Io>>);

impl Connection for PooledStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl hyper::rt::Read for PooledStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.get_mut().0), cx, buf)
    }
}

impl hyper::rt::Write for PooledStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.get_mut().0), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.get_mut().0), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.get_mut().0), cx)
    }

    fn is_write_vectored(&self) -> bool {
        hyper::rt::Write::is_write_vectored(&self.0)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        hyper::rt::Write::poll_write_vectored(Pin::new(&mut self.get_mut().0), cx, bufs)
    }
}

/// Whether the request asks the upstream to switch protocols.
pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
    request.headers().contains_key(UPGRADE)
        && request
            .headers()
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
}

/// Open a connection to the descriptor's endpoint.
///
/// `tune` applies the tunnel socket options (no delay, keepalive).
pub async fn connect(desc: &OutgoingRequest, tune: bool) -> Result<Box<dyn Io>, ProxyError> {
    if let Some(path) = &desc.socket_path {
        let stream = connect_unix(path)
            .await
            .map_err(|source| ProxyError::UpstreamConnect {
                addr: desc.endpoint(),
                source,
            })?;
        return secure(desc, stream).await;
    }

    let host = desc.connect_host();
    let stream = connect_tcp(&host, desc.port, desc.local_address)
        .await
        .map_err(|source| ProxyError::UpstreamConnect {
            addr: desc.endpoint(),
            source,
        })?;
    if tune {
        socket::tune(&stream);
    } else if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    tracing::debug!(endpoint = %desc.endpoint(), secure = desc.is_secure(), "Upstream connected");
    secure(desc, stream).await
}

async fn secure<S: Io>(desc: &OutgoingRequest, stream: S) -> Result<Box<dyn Io>, ProxyError> {
    if !desc.is_secure() {
        return Ok(Box::new(stream));
    }
    let verify = desc.reject_unauthorized.unwrap_or(true);
    let connector = tls::connector(&desc.tls, verify)?;
    let name = tls::server_name(&desc.tls, &desc.connect_host())?;
    let stream = connector
        .connect(name, stream)
        .await
        .map_err(|e| ProxyError::Tls(format!("handshake with {} failed: {}", desc.endpoint(), e)))?;
    Ok(Box::new(stream))
}

#[cfg(unix)]
async fn connect_unix(path: &std::path::Path) -> std::io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(not(unix))]
async fn connect_unix(_path: &std::path::Path) -> std::io::Result<TcpStream> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "unix sockets are not supported on this platform",
    ))
}

async fn connect_tcp(host: &str, port: u16, local: Option<IpAddr>) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        match connect_addr(addr, local).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("no addresses for {}", host))
    }))
}

async fn connect_addr(addr: SocketAddr, local: Option<IpAddr>) -> std::io::Result<TcpStream> {
    let Some(local) = local else {
        return TcpStream::connect(addr).await;
    };
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.bind(SocketAddr::new(local, 0))?;
    socket.connect(addr).await
}

/// Send `request` to the descriptor's endpoint and wait for response headers.
///
/// Requests with an [`Agent`] go through its pool unless they ask for an
/// upgrade or carry an absolute-form path.
pub async fn send(
    desc: &OutgoingRequest,
    request: Request<ProxyBody>,
) -> Result<Response<Incoming>, ProxyError> {
    if let Some(agent) = &desc.agent {
        if !is_upgrade_request(&request) && desc.path.starts_with('/') {
            return agent.send(desc, request).await;
        }
    }

    let upgrade = is_upgrade_request(&request);
    let io = connect(desc, upgrade).await?;
    let mut builder = http1::Builder::new();
    builder.preserve_header_case(desc.preserve_header_case);
    let (mut sender, conn) = builder.handshake(TokioIo::new(io)).await?;

    let endpoint = desc.endpoint();
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!(endpoint = %endpoint, error = %e, "Upstream connection closed with error");
        }
    });

    Ok(sender.send_request(request).await?)
}
