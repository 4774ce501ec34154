//! Outgoing request construction.
//!
//! # Data Flow
//! ```text
//! ProxyOptions + RequestHead + slot (target | forward)
//!     → setup_outgoing (port, passthrough, method, headers, auth, path, host)
//!     → OutgoingRequest (immutable descriptor)
//!     → into_request (hyper Request handed to the transport)
//! ```
//!
//! # Design Decisions
//! - The inbound query string is copied byte for byte, never re-encoded
//! - Without an agent every outbound request asks for `Connection: close`
//!   unless it is an upgrade
//! - The descriptor path always starts with `/` unless it is an absolute
//!   URI sent to another proxy

use std::net::IpAddr;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hyper::header::{HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, HOST};
use hyper::{HeaderMap, Method, Request, Uri, Version};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::schema::{is_ssl, ProxyOptions, Target, TlsMaterial};
use crate::error::ProxyError;
use crate::http::body::ProxyBody;
use crate::http::request::RequestHead;
use crate::net::transport::Agent;

static UPGRADE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(^|,)\s*upgrade\s*($|,)").expect("valid regex"));

/// Which configured destination a request is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSlot {
    Target,
    Forward,
}

/// Fully resolved parameters of one outbound request.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    /// Scheme with trailing colon.
    pub protocol: String,
    pub host: Option<String>,
    pub hostname: Option<String>,
    pub port: u16,
    pub socket_path: Option<PathBuf>,
    pub tls: TlsMaterial,
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Basic auth credentials, `user:pass`.
    pub auth: Option<String>,
    /// Set only for TLS targets.
    pub reject_unauthorized: Option<bool>,
    pub agent: Option<Agent>,
    pub local_address: Option<IpAddr>,
    pub preserve_header_case: bool,
}

impl OutgoingRequest {
    pub fn is_secure(&self) -> bool {
        is_ssl(&self.protocol)
    }

    /// Host to connect to, without port or IPv6 brackets.
    pub fn connect_host(&self) -> String {
        let host = match (&self.hostname, &self.host) {
            (Some(hostname), _) => hostname.as_str(),
            (None, Some(host)) => strip_port(host),
            (None, None) => "localhost",
        };
        host.trim_start_matches('[').trim_end_matches(']').to_string()
    }

    /// Human readable endpoint for logs.
    pub fn endpoint(&self) -> String {
        match &self.socket_path {
            Some(path) => format!("unix:{}", path.display()),
            None => format!("{}:{}", self.connect_host(), self.port),
        }
    }

    /// Turn the descriptor into a hyper request carrying `body`.
    pub fn to_request(&self, body: ProxyBody) -> Result<Request<ProxyBody>, ProxyError> {
        let uri: Uri = self
            .path
            .parse()
            .map_err(|e| ProxyError::MalformedRequest(format!("{}: {}", self.path, e)))?;

        let mut request = Request::new(body);
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = uri;
        *request.version_mut() = Version::HTTP_11;
        *request.headers_mut() = self.headers.clone();

        let headers = request.headers_mut();
        if !headers.contains_key(HOST) {
            let value = self.default_host_header();
            headers.insert(
                HOST,
                HeaderValue::from_str(&value).map_err(|_| ProxyError::InvalidHeader(value))?,
            );
        }
        if let Some(auth) = &self.auth {
            if !headers.contains_key(AUTHORIZATION) {
                let value = format!("Basic {}", BASE64.encode(auth));
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&value)
                        .map_err(|_| ProxyError::InvalidHeader("authorization".to_string()))?,
                );
            }
        }
        Ok(request)
    }

    fn default_host_header(&self) -> String {
        if self.socket_path.is_some() && self.host.is_none() && self.hostname.is_none() {
            return "localhost".to_string();
        }
        let host = self.connect_host();
        let host = if host.contains(':') { format!("[{}]", host) } else { host };
        if requires_port(self.port, &self.protocol) {
            format!("{}:{}", host, self.port)
        } else {
            host
        }
    }
}

/// Build the outbound request descriptor for `slot`.
pub fn setup_outgoing(
    options: &ProxyOptions,
    req: &RequestHead,
    slot: TargetSlot,
) -> Result<OutgoingRequest, ProxyError> {
    let target: &Target = match slot {
        TargetSlot::Target => options.target.as_ref(),
        TargetSlot::Forward => options.forward.as_ref(),
    }
    .ok_or(ProxyError::MissingTarget)?;

    let port = target
        .port
        .unwrap_or(if target.is_secure() { 443 } else { 80 });

    let method = match options.method.as_deref() {
        Some(method) => Method::from_bytes(method.as_bytes())
            .map_err(|_| ProxyError::MalformedRequest(format!("invalid method `{}`", method)))?,
        None => req.method.clone(),
    };

    let mut headers = req.headers.clone();
    if req.version == Version::HTTP_2 && !headers.contains_key(HOST) {
        if let Some(authority) = req.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(HOST, value);
            }
        }
    }
    if let Some(overrides) = &options.headers {
        apply_header_overrides(&mut headers, overrides)?;
    }

    let mut tls = target.tls.clone();
    if let Some(ca) = &options.ca {
        tls.ca = Some(ca.clone());
    }

    let reject_unauthorized = target
        .is_secure()
        .then(|| options.secure.unwrap_or(true));

    let agent = options.agent.clone();
    if agent.is_none() {
        let connection = headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");
        if !UPGRADE_TOKEN.is_match(&connection) {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }
    }

    let target_path = if options.prepend_path_enabled() {
        target.path.as_deref().unwrap_or("")
    } else {
        ""
    };
    let request_uri;
    let outgoing_path = if options.ignore_path.unwrap_or(false) {
        ""
    } else if options.to_proxy.unwrap_or(false) {
        request_uri = req.uri.to_string();
        request_uri.as_str()
    } else {
        req.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    };
    let mut path = join_url(target_path, outgoing_path);
    if !path.starts_with('/') && !path.contains("://") {
        path.insert(0, '/');
    }

    let protocol = target.protocol_or_default().to_string();
    if options.change_origin.unwrap_or(false) {
        if let Some(host) = target.host.as_deref().or(target.hostname.as_deref()) {
            let value = if requires_port(port, &protocol) && !has_port(host) {
                format!("{}:{}", host, port)
            } else {
                host.to_string()
            };
            headers.insert(
                HOST,
                HeaderValue::from_str(&value).map_err(|_| ProxyError::InvalidHeader(value))?,
            );
        }
    }

    Ok(OutgoingRequest {
        protocol,
        host: target.host.clone(),
        hostname: target.hostname.clone(),
        port,
        socket_path: target.socket_path.clone(),
        tls,
        method,
        path,
        headers,
        auth: options.auth.clone(),
        reject_unauthorized,
        agent,
        local_address: options.local_address,
        preserve_header_case: options.preserves_header_case(),
    })
}

/// Merge configured header overrides; an override replaces every inbound
/// value of the same name.
pub fn apply_header_overrides(
    headers: &mut HeaderMap,
    overrides: &std::collections::BTreeMap<String, String>,
) -> Result<(), ProxyError> {
    for (name, value) in overrides {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProxyError::InvalidHeader(name.clone()))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|_| ProxyError::InvalidHeader(name.clone()))?;
        headers.insert(header_name, header_value);
    }
    Ok(())
}

/// Join a base path and a request path with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    if base.is_empty() || base == "/" {
        return if path.is_empty() { "/".to_string() } else { path.to_string() };
    }
    if path.is_empty() || path == "/" {
        return base.to_string();
    }
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Whether `port` differs from the standard port of `protocol`.
pub fn requires_port(port: u16, protocol: &str) -> bool {
    if port == 0 {
        return false;
    }
    let scheme = protocol.split(':').next().unwrap_or("");
    match scheme {
        "http" | "ws" => port != 80,
        "https" | "wss" => port != 443,
        "ftp" => port != 21,
        "gopher" => port != 70,
        "file" => false,
        _ => true,
    }
}

/// Whether a host string already carries a port.
pub fn has_port(host: &str) -> bool {
    host.contains(':')
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn head(method: Method, uri: &str) -> RequestHead {
        RequestHead::new(method, uri.parse().unwrap())
    }

    fn options(target: &str) -> ProxyOptions {
        ProxyOptions::for_target(target).unwrap()
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("", ""), "/");
        assert_eq!(join_url("/", ""), "/");
        assert_eq!(join_url("", "/path"), "/path");
        assert_eq!(join_url("/base", ""), "/base");
        assert_eq!(join_url("/base", "/"), "/base");
        assert_eq!(join_url("/base/", "/path"), "/base/path");
        assert_eq!(join_url("base", "path"), "base/path");
        assert_eq!(join_url("/base", "/path"), "/base/path");
        assert_eq!(join_url("/base/", "path"), "/base/path");
    }

    #[test]
    fn test_requires_port() {
        assert!(!requires_port(80, "http:"));
        assert!(requires_port(8080, "http"));
        assert!(!requires_port(443, "https:"));
        assert!(requires_port(6984, "https:"));
        assert!(!requires_port(443, "wss"));
        assert!(!requires_port(21, "ftp:"));
        assert!(!requires_port(70, "gopher:"));
        assert!(!requires_port(1234, "file:"));
        assert!(requires_port(1, "redis:"));
        assert!(!requires_port(0, "http:"));
    }

    #[test]
    fn test_port_inference() {
        let req = head(Method::GET, "/");
        let out = setup_outgoing(&options("https://example.com"), &req, TargetSlot::Target).unwrap();
        assert_eq!(out.port, 443);
        assert_eq!(out.reject_unauthorized, Some(true));

        let out = setup_outgoing(&options("http://example.com"), &req, TargetSlot::Target).unwrap();
        assert_eq!(out.port, 80);
        assert_eq!(out.reject_unauthorized, None);

        let mut opts = ProxyOptions::default();
        opts.target = Some(Target {
            host: Some("example.com".into()),
            protocol: Some("https".into()),
            ..Default::default()
        });
        opts.secure = Some(false);
        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        assert_eq!(out.port, 443);
        assert_eq!(out.reject_unauthorized, Some(false));
    }

    #[test]
    fn test_header_merge_precedence() {
        let mut req = head(Method::GET, "/");
        req.headers.insert("pro", "xy".parse().unwrap());
        req.headers.insert("fizz", "inbound".parse().unwrap());
        let mut opts = options("http://example.com");
        opts.headers = Some(BTreeMap::from([("fizz".to_string(), "bang".to_string())]));

        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        assert_eq!(out.headers["pro"], "xy");
        assert_eq!(out.headers["fizz"], "bang");
        assert_eq!(out.headers.get_all("fizz").iter().count(), 1);
    }

    #[test]
    fn test_connection_close_without_agent() {
        let req = head(Method::GET, "/");
        let out = setup_outgoing(&options("http://example.com"), &req, TargetSlot::Target).unwrap();
        assert_eq!(out.headers[CONNECTION], "close");

        let mut req = head(Method::GET, "/");
        req.headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        let out = setup_outgoing(&options("http://example.com"), &req, TargetSlot::Target).unwrap();
        assert_eq!(out.headers[CONNECTION], "close");
    }

    #[test]
    fn test_upgrade_connection_untouched() {
        for value in ["Upgrade", "keep-alive, Upgrade", "upgrade ,keep-alive"] {
            let mut req = head(Method::GET, "/");
            req.headers.insert(CONNECTION, value.parse().unwrap());
            let out = setup_outgoing(&options("http://example.com"), &req, TargetSlot::Target).unwrap();
            assert_eq!(out.headers[CONNECTION], value);
        }
        let mut req = head(Method::GET, "/");
        req.headers.insert(CONNECTION, "upgrades".parse().unwrap());
        let out = setup_outgoing(&options("http://example.com"), &req, TargetSlot::Target).unwrap();
        assert_eq!(out.headers[CONNECTION], "close");
    }

    #[test]
    fn test_agent_keeps_connection_header() {
        let mut req = head(Method::GET, "/");
        req.headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        let mut opts = options("http://example.com");
        opts.agent = Some(Agent::new());
        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        assert_eq!(out.headers[CONNECTION], "keep-alive");
    }

    #[test]
    fn test_change_origin_host() {
        let req = head(Method::GET, "/");
        let mut opts = options("https://mycouch.com:6984");
        opts.change_origin = Some(true);
        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        assert_eq!(out.headers[HOST], "mycouch.com:6984");

        let mut opts = ProxyOptions::default();
        opts.target = Some(Target {
            host: Some("mycouch.com".into()),
            port: Some(6984),
            protocol: Some("https:".into()),
            ..Default::default()
        });
        opts.change_origin = Some(true);
        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        assert_eq!(out.headers[HOST], "mycouch.com:6984");

        let mut opts = options("https://mycouch.com");
        opts.change_origin = Some(true);
        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        assert_eq!(out.headers[HOST], "mycouch.com");
    }

    #[test]
    fn test_path_composition() {
        let req = head(Method::GET, "/a/b//c?x=1");
        let out = setup_outgoing(&options("http://main/base"), &req, TargetSlot::Target).unwrap();
        assert_eq!(out.path, "/base/a/b//c?x=1");

        let out = setup_outgoing(&options("http://main"), &req, TargetSlot::Target).unwrap();
        assert_eq!(out.path, "/a/b//c?x=1");

        let mut opts = options("http://main/forward");
        opts.prepend_path = Some(false);
        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        assert_eq!(out.path, "/a/b//c?x=1");

        let mut opts = options("http://main/forward");
        opts.ignore_path = Some(true);
        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        assert_eq!(out.path, "/forward");

        let mut opts = options("http://main/forward");
        opts.ignore_path = Some(true);
        opts.prepend_path = Some(false);
        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        assert_eq!(out.path, "/");
    }

    #[test]
    fn test_query_with_embedded_url_is_verbatim() {
        let req = head(Method::GET, "/?url=http://example.com/?a=b%20c&d=e");
        let out = setup_outgoing(&options("http://main/some-path"), &req, TargetSlot::Target).unwrap();
        assert_eq!(out.path, "/some-path/?url=http://example.com/?a=b%20c&d=e");
    }

    #[test]
    fn test_relative_target_path_gets_leading_slash() {
        let req = head(Method::GET, "/am");
        let mut opts = ProxyOptions::default();
        opts.target = Some(Target {
            host: Some("main".into()),
            path: Some("some-path".into()),
            ..Default::default()
        });
        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        assert_eq!(out.path, "/some-path/am");
    }

    #[test]
    fn test_to_proxy_passes_absolute_uri() {
        let req = head(Method::GET, "http://google.com/?q=1");
        let mut opts = options("http://upstream-proxy:3128");
        opts.to_proxy = Some(true);
        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        assert_eq!(out.path, "http://google.com/?q=1");
    }

    #[test]
    fn test_forward_slot_and_method_override() {
        let req = head(Method::POST, "/submit");
        let mut opts = ProxyOptions::default();
        opts.forward = Some("http://audit:9000/log".parse().unwrap());
        opts.method = Some("PUT".into());
        let out = setup_outgoing(&opts, &req, TargetSlot::Forward).unwrap();
        assert_eq!(out.method, Method::PUT);
        assert_eq!(out.port, 9000);
        assert_eq!(out.path, "/log/submit");
        assert!(matches!(
            setup_outgoing(&opts, &req, TargetSlot::Target),
            Err(ProxyError::MissingTarget)
        ));
    }

    #[test]
    fn test_passthrough_fields() {
        let req = head(Method::GET, "/");
        let mut opts = ProxyOptions::default();
        opts.target = Some(Target {
            host: Some("localhost".into()),
            socket_path: Some("/tmp/app.sock".into()),
            tls: TlsMaterial {
                ciphers: Some("TLS13_AES_128_GCM_SHA256".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        opts.auth = Some("user:pass".into());
        opts.ca = Some("my-ca".into());
        opts.local_address = Some("127.0.0.1".parse().unwrap());
        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        assert_eq!(out.socket_path, Some(PathBuf::from("/tmp/app.sock")));
        assert_eq!(out.tls.ca.as_deref(), Some("my-ca"));
        assert_eq!(out.tls.ciphers.as_deref(), Some("TLS13_AES_128_GCM_SHA256"));
        assert_eq!(out.local_address, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(out.auth.as_deref(), Some("user:pass"));
    }

    #[test]
    fn test_http2_authority_supplies_host() {
        let mut req = head(Method::GET, "https://inbound.example:8443/x");
        req.version = Version::HTTP_2;
        let out = setup_outgoing(&options("http://main"), &req, TargetSlot::Target).unwrap();
        assert_eq!(out.headers[HOST], "inbound.example:8443");
        assert_eq!(out.path, "/x");
    }

    #[test]
    fn test_to_request_adds_host_and_auth() {
        let req = head(Method::GET, "/");
        let mut opts = options("http://example.com:8080");
        opts.auth = Some("user:pass".into());
        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        let request = out.to_request(crate::http::body::empty()).unwrap();
        assert_eq!(request.headers()[HOST], "example.com:8080");
        assert_eq!(request.headers()[AUTHORIZATION], "Basic dXNlcjpwYXNz");
        assert_eq!(request.uri(), "/");
    }

    #[test]
    fn test_connect_host() {
        let req = head(Method::GET, "/");
        let out = setup_outgoing(&options("http://[::1]:3000"), &req, TargetSlot::Target).unwrap();
        assert_eq!(out.connect_host(), "::1");
        assert_eq!(out.endpoint(), "::1:3000");

        let mut opts = ProxyOptions::default();
        opts.target = Some(Target {
            host: Some("example.com:9000".into()),
            ..Default::default()
        });
        let out = setup_outgoing(&opts, &req, TargetSlot::Target).unwrap();
        assert_eq!(out.connect_host(), "example.com");
    }
}
