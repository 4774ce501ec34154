//! Client sockets for upgrade requests.
//!
//! # Responsibilities
//! - Abstract over a raw byte stream and a hyper connection awaiting upgrade
//! - Relay a declined upgrade response verbatim
//! - Write `101 Switching Protocols` and hand out the tunnel stream
//! - Re-inject already-read upgrade head bytes
//!
//! # Design Decisions
//! - A raw stream gets status line and headers written by hand, the way an
//!   HTTP/1.1 peer expects them after an upgrade request
//! - A hyper connection answers through a oneshot; hyper writes the response
//!   and yields the upgraded stream afterwards

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::error::ProxyError;
use crate::http::body::{self, ProxyBody};

/// Byte stream usable on either side of a tunnel.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// Tunnel socket options: no Nagle delay, keepalive on.
pub fn tune(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    if let Err(e) = sock.set_keepalive(true) {
        tracing::debug!(error = %e, "Failed to set SO_KEEPALIVE");
    }
}

/// Stream that yields `prefix` before reading from `inner`.
pub struct PrefixedIo<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedIo<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedIo<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedIo<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Wrap `stream` so `head` is read first; no-op for an empty head.
pub fn with_head(head: Bytes, stream: Box<dyn Io>) -> Box<dyn Io> {
    if head.is_empty() {
        stream
    } else {
        Box::new(PrefixedIo::new(head, stream))
    }
}

/// Response a hyper service should return for an upgrade request handed to
/// a [`ClientSocket::upgradable`] socket.
pub struct PendingResponse {
    rx: oneshot::Receiver<Response<ProxyBody>>,
}

impl PendingResponse {
    /// Wait for the response; `None` means the socket was destroyed and the
    /// connection should be dropped without a response.
    pub async fn response(self) -> Option<Response<ProxyBody>> {
        self.rx.await.ok()
    }
}

enum SocketState {
    Stream(Box<dyn Io>),
    Upgradable {
        on_upgrade: OnUpgrade,
        reply: oneshot::Sender<Response<ProxyBody>>,
    },
    Detached,
    Destroyed,
}

/// The client side of an upgrade request.
pub struct ClientSocket {
    state: SocketState,
}

impl ClientSocket {
    /// A raw stream positioned right after the upgrade request head.
    pub fn from_stream<S: Io>(stream: S) -> Self {
        Self {
            state: SocketState::Stream(Box::new(stream)),
        }
    }

    /// A TCP stream, tuned for tunnelling.
    pub fn from_tcp(stream: TcpStream) -> Self {
        tune(&stream);
        Self::from_stream(stream)
    }

    /// A hyper server connection; the service must return what
    /// [`PendingResponse::response`] yields.
    pub fn upgradable<B>(req: &mut Request<B>) -> (Self, PendingResponse) {
        let on_upgrade = hyper::upgrade::on(req);
        let (reply, rx) = oneshot::channel();
        (
            Self {
                state: SocketState::Upgradable { on_upgrade, reply },
            },
            PendingResponse { rx },
        )
    }

    /// Close the client connection without a response.
    pub fn destroy(&mut self) {
        self.state = SocketState::Destroyed;
    }

    /// Close the client connection gracefully: pending writes are flushed
    /// before the write side shuts down. A hyper connection is released
    /// without a response.
    pub async fn end(&mut self) {
        match std::mem::replace(&mut self.state, SocketState::Detached) {
            SocketState::Stream(mut stream) => {
                if let Err(e) = stream.shutdown().await {
                    tracing::debug!(error = %e, "Client socket shutdown failed");
                }
            }
            SocketState::Upgradable { .. } => {}
            state => self.state = state,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self.state, SocketState::Destroyed)
    }

    /// Resolves if the client goes away while we wait for the upstream.
    pub(crate) async fn closed(&mut self) {
        match &mut self.state {
            SocketState::Upgradable { reply, .. } => reply.closed().await,
            _ => std::future::pending::<()>().await,
        }
    }

    /// Relay a non-upgrade upstream response and end the socket.
    pub(crate) async fn relay(&mut self, response: Response<Incoming>) -> Result<(), ProxyError> {
        match std::mem::replace(&mut self.state, SocketState::Detached) {
            SocketState::Stream(mut stream) => {
                let (parts, incoming) = response.into_parts();
                let mut headers = parts.headers;
                if headers.remove(TRANSFER_ENCODING).is_some() {
                    headers.remove(CONTENT_LENGTH);
                }
                let reason = parts
                    .extensions
                    .get::<ReasonPhrase>()
                    .map(|r| String::from_utf8_lossy(r.as_bytes()).into_owned());
                let head = http_head(parts.version, parts.status, reason.as_deref(), &headers);
                stream.write_all(head.as_bytes()).await?;

                let mut incoming = incoming;
                while let Some(frame) = incoming.frame().await {
                    if let Ok(data) = frame?.into_data() {
                        stream.write_all(&data).await?;
                    }
                }
                stream.shutdown().await?;
                Ok(())
            }
            SocketState::Upgradable { reply, .. } => {
                let response = response.map(body::boxed);
                let _ = reply.send(response);
                Ok(())
            }
            state => {
                self.state = state;
                Err(ProxyError::ConnectionReset("client socket already closed".to_string()))
            }
        }
    }

    /// Answer `101 Switching Protocols` with the upstream's headers and
    /// return the client stream with `head` re-injected.
    pub(crate) async fn switch_protocols(
        &mut self,
        headers: &HeaderMap,
        head: Bytes,
    ) -> Result<Box<dyn Io>, ProxyError> {
        match std::mem::replace(&mut self.state, SocketState::Detached) {
            SocketState::Stream(mut stream) => {
                let line = http_head(
                    Version::HTTP_11,
                    StatusCode::SWITCHING_PROTOCOLS,
                    Some("Switching Protocols"),
                    headers,
                );
                stream.write_all(line.as_bytes()).await?;
                Ok(with_head(head, stream))
            }
            SocketState::Upgradable { on_upgrade, reply } => {
                let mut response = Response::new(body::empty());
                *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
                *response.headers_mut() = headers.clone();
                reply
                    .send(response)
                    .map_err(|_| ProxyError::ConnectionReset("client went away".to_string()))?;
                let upgraded = on_upgrade.await?;
                Ok(with_head(head, Box::new(TokioIo::new(upgraded))))
            }
            state => {
                self.state = state;
                Err(ProxyError::ConnectionReset("client socket already closed".to_string()))
            }
        }
    }
}

impl std::fmt::Debug for ClientSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            SocketState::Stream(_) => "stream",
            SocketState::Upgradable { .. } => "upgradable",
            SocketState::Detached => "detached",
            SocketState::Destroyed => "destroyed",
        };
        f.debug_struct("ClientSocket").field("state", &state).finish()
    }
}

/// Status line plus header block, one line per header value.
pub fn http_head(version: Version, status: StatusCode, reason: Option<&str>, headers: &HeaderMap) -> String {
    let version = match version {
        Version::HTTP_10 => "1.0",
        _ => "1.1",
    };
    let reason = reason
        .or_else(|| status.canonical_reason())
        .unwrap_or("");
    let mut head = format!("HTTP/{} {} {}\r\n", version, status.as_u16(), reason);
    for (name, value) in headers {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}
