//! Inbound request representation.
//!
//! A [`ProxyRequest`] is what a caller hands to `web`/`ws`: the request head,
//! its (not yet consumed) body, and the state of the client socket it
//! arrived on.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Body;
use hyper::header::{HeaderName, HOST};
use hyper::{HeaderMap, Method, Request, Uri, Version};

use crate::http::body::{self, BoxError, ProxyBody};

/// Method, URI, version, headers and connection facts of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// Peer address of the client connection.
    pub remote_addr: Option<SocketAddr>,
    /// Whether the client connection is TLS.
    pub encrypted: bool,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            remote_addr: None,
            encrypted: false,
        }
    }

    /// First value of `name` as a string, if valid UTF-8.
    pub fn header_str(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = HeaderName::from_bytes(name.as_ref().as_bytes()).ok()?;
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Host header, or the URI authority for HTTP/2 requests.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.uri.authority().map(|a| a.as_str()))
    }
}

/// Client socket state shared between the passes and the response relay.
#[derive(Debug, Clone, Default)]
pub struct InboundSocket {
    destroyed: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl InboundSocket {
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Idle timeout after which the inbound connection is destroyed.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }
}

/// An inbound request being proxied.
pub struct ProxyRequest {
    pub head: RequestHead,
    body: Option<ProxyBody>,
    socket: InboundSocket,
}

impl ProxyRequest {
    /// Wrap a hyper request.
    pub fn new<B>(req: Request<B>) -> Self
    where
        B: Body<Data = bytes::Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        Self {
            head: RequestHead {
                method: parts.method,
                uri: parts.uri,
                version: parts.version,
                headers: parts.headers,
                remote_addr: None,
                encrypted: false,
            },
            body: Some(body::boxed(body)),
            socket: InboundSocket::default(),
        }
    }

    /// A request with no body.
    pub fn from_head(head: RequestHead) -> Self {
        Self {
            head,
            body: None,
            socket: InboundSocket::default(),
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.head.remote_addr = Some(addr);
        self
    }

    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.head.encrypted = encrypted;
        self
    }

    /// Take the body for sending upstream; later calls get an empty body.
    pub fn take_body(&mut self) -> ProxyBody {
        self.body.take().unwrap_or_else(body::empty)
    }

    pub fn socket(&self) -> &InboundSocket {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut InboundSocket {
        &mut self.socket
    }
}

impl std::fmt::Debug for ProxyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRequest")
            .field("head", &self.head)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};

    #[tokio::test]
    async fn test_take_body_once() {
        let req = Request::post("/upload").body(Full::new(bytes::Bytes::from("data"))).unwrap();
        let mut req = ProxyRequest::new(req);
        let first = req.take_body().collect().await.unwrap().to_bytes();
        let second = req.take_body().collect().await.unwrap().to_bytes();
        assert_eq!(first, "data");
        assert!(second.is_empty());
    }

    #[test]
    fn test_host_falls_back_to_authority() {
        let mut head = RequestHead::new(Method::GET, "https://example.com:8443/x".parse().unwrap());
        head.version = Version::HTTP_2;
        assert_eq!(head.host(), Some("example.com:8443"));
        head.headers.insert(HOST, "other".parse().unwrap());
        assert_eq!(head.host(), Some("other"));
    }

    #[test]
    fn test_socket_state_is_shared() {
        let req = ProxyRequest::from_head(RequestHead::new(Method::GET, Uri::from_static("/")));
        let socket = req.socket().clone();
        socket.destroy();
        assert!(req.socket().is_destroyed());
    }
}
