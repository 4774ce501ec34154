//! The client-facing response being assembled by a flow.

use bytes::Bytes;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderName, HeaderValue};
use hyper::http::Extensions;
use hyper::{HeaderMap, Response, StatusCode};

use crate::http::body::{self, ProxyBody};

/// Response sink handed to `web` alongside the request.
///
/// Passes and `proxyRes` listeners write status, headers and body here; the
/// caller turns it into a hyper response with [`ServerResponse::into_response`].
#[derive(Debug, Default)]
pub struct ServerResponse {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Option<ProxyBody>,
    headers_sent: bool,
    finished: bool,
}

impl ServerResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Non-canonical reason phrase, if one was set.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Commit the status line and headers.
    pub fn write_head(&mut self) {
        self.headers_sent = true;
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Stream `body` to the client.
    pub fn send(&mut self, body: ProxyBody) {
        self.headers_sent = true;
        self.body = Some(body);
    }

    /// Finish the response without a body.
    pub fn end(&mut self) {
        self.headers_sent = true;
        self.finished = true;
    }

    /// Finish the response with `data` as body.
    pub fn end_with(&mut self, data: impl Into<Bytes>) {
        self.body = Some(body::full(data));
        self.end();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether anything was written. An untouched response means the flow
    /// produced nothing for the client.
    pub fn is_touched(&self) -> bool {
        self.headers_sent || self.finished || self.body.is_some()
    }

    pub fn take_body(&mut self) -> Option<ProxyBody> {
        self.body.take()
    }

    pub fn into_response(self) -> Response<ProxyBody> {
        let mut response = Response::new(self.body.unwrap_or_else(body::empty));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        *response.extensions_mut() = self.extensions;
        if let Some(reason) = self.reason {
            match ReasonPhrase::try_from(reason) {
                Ok(reason) => {
                    response.extensions_mut().insert(reason);
                }
                Err(_) => tracing::debug!("Dropping invalid reason phrase"),
            }
        }
        response
    }
}
