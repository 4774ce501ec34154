//! One-shot request/response proxying to a fixed address.
//!
//! # Data Flow
//! ```text
//! addr + input (URL | Request) + init overrides
//!     → OutgoingRequest (plain HTTP, TCP or unix socket)
//!     → transport::send
//!     → hop-by-hop headers stripped, no body for 204/304
//! ```
//!
//! Redirects are never followed; a 3xx comes back as-is.

use bytes::Bytes;
use hyper::body::Body;
use hyper::header::{CONNECTION, TRANSFER_ENCODING};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use url::Url;

use crate::config::schema::TlsMaterial;
use crate::error::ProxyError;
use crate::http::body::{self, BoxError, ProxyBody};
use crate::http::outgoing::OutgoingRequest;
use crate::net::address::ProxyAddr;
use crate::net::transport;

/// What to fetch: an absolute URL, or a full request.
pub enum FetchInput {
    Url(String),
    Request(Request<ProxyBody>),
}

impl From<&str> for FetchInput {
    fn from(url: &str) -> Self {
        FetchInput::Url(url.to_string())
    }
}

impl From<String> for FetchInput {
    fn from(url: String) -> Self {
        FetchInput::Url(url)
    }
}

impl From<Url> for FetchInput {
    fn from(url: Url) -> Self {
        FetchInput::Url(url.into())
    }
}

impl<B> From<Request<B>> for FetchInput
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    fn from(request: Request<B>) -> Self {
        FetchInput::Request(request.map(body::boxed))
    }
}

impl std::fmt::Debug for FetchInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchInput::Url(url) => f.debug_tuple("Url").field(url).finish(),
            FetchInput::Request(req) => f
                .debug_struct("Request")
                .field("method", req.method())
                .field("uri", req.uri())
                .finish(),
        }
    }
}

/// Overrides applied on top of the input; each set field replaces the
/// input's value wholesale.
#[derive(Default)]
pub struct FetchInit {
    pub method: Option<Method>,
    pub headers: Option<HeaderMap>,
    pub body: Option<ProxyBody>,
}

/// Send `input` to `addr` and return the upstream response.
///
/// Only plain HTTP is spoken to the address. A missing `Host` header
/// defaults to the address (`localhost` for unix sockets).
pub async fn proxy_fetch<A>(
    addr: A,
    input: impl Into<FetchInput>,
    init: Option<FetchInit>,
) -> Result<Response<ProxyBody>, ProxyError>
where
    A: TryInto<ProxyAddr>,
    ProxyError: From<A::Error>,
{
    let addr: ProxyAddr = addr.try_into()?;
    let (path, mut method, mut headers, mut payload) = match input.into() {
        FetchInput::Url(url) => {
            let url = Url::parse(&url).map_err(|e| ProxyError::MalformedRequest(format!("{}: {}", url, e)))?;
            (path_and_query(&url), Method::GET, HeaderMap::new(), body::empty())
        }
        FetchInput::Request(request) => {
            let (parts, payload) = request.into_parts();
            let path = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            (path, parts.method, parts.headers, payload)
        }
    };
    if let Some(init) = init {
        if let Some(m) = init.method {
            method = m;
        }
        if let Some(h) = init.headers {
            headers = h;
        }
        if let Some(b) = init.body {
            payload = b;
        }
    }

    let desc = descriptor(&addr, method, path, headers);
    tracing::debug!(endpoint = %desc.endpoint(), method = %desc.method, path = %desc.path, "Fetching");
    let request = desc.to_request(payload)?;
    let response = transport::send(&desc, request).await?;

    let (mut parts, incoming) = response.into_parts();
    for name in [TRANSFER_ENCODING, CONNECTION] {
        parts.headers.remove(name);
    }
    parts.headers.remove("keep-alive");

    let payload = if parts.status == StatusCode::NO_CONTENT || parts.status == StatusCode::NOT_MODIFIED {
        body::empty()
    } else {
        body::boxed(incoming)
    };
    Ok(Response::from_parts(parts, payload))
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn descriptor(addr: &ProxyAddr, method: Method, path: String, headers: HeaderMap) -> OutgoingRequest {
    let (hostname, port, socket_path) = match addr {
        ProxyAddr::Tcp { host, port } => (Some(host.clone()), *port, None),
        ProxyAddr::Unix(path) => (None, 80, Some(path.clone())),
    };
    OutgoingRequest {
        protocol: "http:".to_string(),
        host: None,
        hostname,
        port,
        socket_path,
        tls: TlsMaterial::default(),
        method,
        path,
        headers,
        auth: None,
        reject_unauthorized: None,
        agent: None,
        local_address: None,
        preserve_header_case: false,
    }
}
