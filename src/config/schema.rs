//! Configuration schema definitions.
//!
//! This module defines the proxy options and the binary's root config.
//! All types derive Serde traits for deserialization from config files.
//! Every proxy option is an `Option` so per-call options can be merged over
//! server defaults without losing the difference between "unset" and "false".

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ProxyError;
use crate::net::transport::Agent;

/// Redirect hops followed when `follow_redirects = true`.
pub const DEFAULT_MAX_REDIRECTS: u32 = 5;

/// Largest request body kept in memory for 307/308 replay.
pub const DEFAULT_REDIRECT_BODY_LIMIT: usize = 1024 * 1024;

/// Root configuration for the proxy binary.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Where `listen` binds.
    pub listener: ListenerConfig,

    /// Server-wide proxy defaults.
    pub proxy: ProxyOptions,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Port to bind.
    pub port: u16,

    /// Interface to bind (all interfaces when unset).
    pub hostname: Option<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            hostname: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,

    /// Whether to expose Prometheus metrics.
    pub metrics_enabled: bool,

    /// Address of the metrics endpoint.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// TLS material for the listener (PEM files).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListenerTls {
    /// Path to certificate chain file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,
}

/// TLS material passed through to an outbound connection (PEM contents).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsMaterial {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub passphrase: Option<String>,
    pub pfx: Option<String>,
    /// Colon separated rustls cipher suite names.
    pub ciphers: Option<String>,
    /// `TLSv1_2_method` or `TLSv1_3_method`.
    pub secure_protocol: Option<String>,
    /// SNI override.
    pub servername: Option<String>,
}

impl TlsMaterial {
    pub fn is_empty(&self) -> bool {
        *self == TlsMaterial::default()
    }
}

/// A resolved proxy destination.
///
/// Built from a URL string, a parsed [`Url`], or a detailed table with
/// `host`/`port` or `socket_path`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "TargetSpec", into = "TargetSpec")]
pub struct Target {
    /// Scheme with trailing colon (`http:`), as in a parsed URL.
    pub protocol: Option<String>,
    /// Host, possibly carrying `:port` when built from a URL.
    pub host: Option<String>,
    /// Host without port.
    pub hostname: Option<String>,
    pub port: Option<u16>,
    /// Path prefix prepended to every proxied path.
    pub path: Option<String>,
    pub socket_path: Option<PathBuf>,
    pub tls: TlsMaterial,
}

impl Target {
    /// Build a target from a parsed URL.
    pub fn from_url(url: &Url) -> Result<Self, ProxyError> {
        let hostname = url
            .host_str()
            .ok_or_else(|| ProxyError::InvalidAddress(format!("{}: missing host", url)))?
            .to_string();
        let host = match url.port() {
            Some(port) => format!("{}:{}", hostname, port),
            None => hostname.clone(),
        };
        Ok(Self {
            protocol: Some(format!("{}:", url.scheme())),
            host: Some(host),
            hostname: Some(hostname),
            port: url.port(),
            path: Some(url.path().to_string()),
            socket_path: None,
            tls: TlsMaterial::default(),
        })
    }

    /// Whether the protocol selects TLS (`https` prefix or `wss`).
    pub fn is_secure(&self) -> bool {
        self.protocol.as_deref().map(is_ssl).unwrap_or(false)
    }

    /// Protocol, defaulting to `http:`.
    pub fn protocol_or_default(&self) -> &str {
        self.protocol.as_deref().unwrap_or("http:")
    }

    /// Absolute URL of the target, used to resolve redirect locations.
    pub fn to_url(&self) -> Option<Url> {
        let host = self.host.as_deref().or(self.hostname.as_deref())?;
        let authority = match self.port {
            Some(port) if !host.contains(':') || host.ends_with(']') => format!("{}:{}", host, port),
            _ => host.to_string(),
        };
        let path = self.path.as_deref().unwrap_or("/");
        let path = if path.starts_with('/') { path.to_string() } else { format!("/{}", path) };
        Url::parse(&format!("{}//{}{}", self.protocol_or_default(), authority, path)).ok()
    }
}

impl FromStr for Target {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| ProxyError::InvalidAddress(format!("{}: {}", s, e)))?;
        Target::from_url(&url)
    }
}

impl TryFrom<&Url> for Target {
    type Error = ProxyError;

    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        Target::from_url(url)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.socket_path {
            return write!(f, "unix:{}", path.display());
        }
        let host = self.host.as_deref().or(self.hostname.as_deref()).unwrap_or("");
        write!(f, "{}//{}", self.protocol_or_default(), host)?;
        if let (Some(port), false) = (self.port, host.contains(':')) {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.path.as_deref().unwrap_or(""))
    }
}

/// Serialized form of a [`Target`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TargetSpec {
    Url(String),
    Detailed(TargetFields),
}

/// Detailed target table.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetFields {
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub socket_path: Option<PathBuf>,
    #[serde(flatten)]
    pub tls: TlsMaterial,
}

impl TryFrom<TargetSpec> for Target {
    type Error = ProxyError;

    fn try_from(spec: TargetSpec) -> Result<Self, Self::Error> {
        match spec {
            TargetSpec::Url(s) => s.parse(),
            TargetSpec::Detailed(fields) => {
                if fields.host.is_none() && fields.hostname.is_none() && fields.socket_path.is_none() {
                    return Err(ProxyError::InvalidAddress(
                        "target needs a host or a socket path".to_string(),
                    ));
                }
                let protocol = fields.protocol.map(|p| {
                    if p.ends_with(':') { p } else { format!("{}:", p) }
                });
                Ok(Target {
                    protocol,
                    host: fields.host,
                    hostname: fields.hostname,
                    port: fields.port,
                    path: fields.path,
                    socket_path: fields.socket_path,
                    tls: fields.tls,
                })
            }
        }
    }
}

impl From<Target> for TargetSpec {
    fn from(target: Target) -> Self {
        TargetSpec::Detailed(TargetFields {
            protocol: target.protocol,
            host: target.host,
            hostname: target.hostname,
            port: target.port,
            path: target.path,
            socket_path: target.socket_path,
            tls: target.tls,
        })
    }
}

/// `^https|wss` as used for port and verification defaults.
pub fn is_ssl(protocol: &str) -> bool {
    protocol.starts_with("https") || protocol.contains("wss")
}

/// Cookie domain/path rewrite rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "RawCookieRewrite", into = "RawCookieRewrite")]
pub enum CookieRewrite {
    /// No rewriting.
    #[default]
    Disabled,
    /// Every value is replaced (empty string removes the attribute).
    Wildcard(String),
    /// Exact value matches, with `*` as fallback.
    Rules(BTreeMap<String, String>),
}

impl CookieRewrite {
    /// Replacement for `value`, if any rule applies.
    pub fn lookup(&self, value: &str) -> Option<&str> {
        match self {
            CookieRewrite::Disabled => None,
            CookieRewrite::Wildcard(s) => Some(s.as_str()),
            CookieRewrite::Rules(rules) => rules
                .get(value)
                .or_else(|| rules.get("*"))
                .map(String::as_str),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, CookieRewrite::Disabled)
    }
}

#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum RawCookieRewrite {
    Flag(bool),
    Wildcard(String),
    Rules(BTreeMap<String, String>),
}

impl From<RawCookieRewrite> for CookieRewrite {
    fn from(raw: RawCookieRewrite) -> Self {
        match raw {
            RawCookieRewrite::Flag(_) => CookieRewrite::Disabled,
            RawCookieRewrite::Wildcard(s) => CookieRewrite::Wildcard(s),
            RawCookieRewrite::Rules(rules) => CookieRewrite::Rules(rules),
        }
    }
}

impl From<CookieRewrite> for RawCookieRewrite {
    fn from(rule: CookieRewrite) -> Self {
        match rule {
            CookieRewrite::Disabled => RawCookieRewrite::Flag(false),
            CookieRewrite::Wildcard(s) => RawCookieRewrite::Wildcard(s),
            CookieRewrite::Rules(rules) => RawCookieRewrite::Rules(rules),
        }
    }
}

/// `follow_redirects = true` or a hop count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FollowRedirects {
    Enabled(bool),
    Limit(u32),
}

impl FollowRedirects {
    /// Maximum number of hops; zero disables following.
    pub fn max_hops(self) -> u32 {
        match self {
            FollowRedirects::Enabled(true) => DEFAULT_MAX_REDIRECTS,
            FollowRedirects::Enabled(false) => 0,
            FollowRedirects::Limit(n) => n,
        }
    }
}

/// Options for one proxy operation.
///
/// Server-wide defaults and per-call overrides share this type; see
/// [`ProxyOptions::merged_over`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyOptions {
    /// Primary upstream.
    pub target: Option<Target>,
    /// Fire-and-forget copy destination.
    pub forward: Option<Target>,
    /// Proxy WebSocket upgrades when listening.
    pub ws: Option<bool>,
    /// Add `x-forwarded-*` headers.
    pub xfwd: Option<bool>,
    /// Verify upstream TLS certificates (default true).
    pub secure: Option<bool>,
    /// Send the absolute request URI as path (chained proxies).
    pub to_proxy: Option<bool>,
    /// Prefix the target path (default true).
    pub prepend_path: Option<bool>,
    /// Drop the inbound path.
    pub ignore_path: Option<bool>,
    /// Local interface for outbound connections.
    pub local_address: Option<IpAddr>,
    /// Rewrite `Host` to the target.
    pub change_origin: Option<bool>,
    /// Keep upstream header name casing in responses.
    pub preserve_header_key_case: Option<bool>,
    /// Basic auth credentials, `user:pass`.
    pub auth: Option<String>,
    /// Host used to rewrite redirect locations.
    pub host_rewrite: Option<String>,
    /// Rewrite redirect locations to the inbound host.
    pub auto_rewrite: Option<bool>,
    /// Protocol used to rewrite redirect locations (`http`/`https`).
    pub protocol_rewrite: Option<String>,
    pub cookie_domain_rewrite: Option<CookieRewrite>,
    pub cookie_path_rewrite: Option<CookieRewrite>,
    /// Header overrides for outbound requests.
    pub headers: Option<BTreeMap<String, String>>,
    /// Outbound response-wait timeout in milliseconds.
    pub proxy_timeout: Option<u64>,
    /// Inbound socket timeout in milliseconds.
    pub timeout: Option<u64>,
    /// Leave response writing to `proxyRes` listeners.
    pub self_handle_response: Option<bool>,
    /// Alternate request body sent instead of the inbound one.
    #[serde(skip)]
    pub buffer: Option<Bytes>,
    pub follow_redirects: Option<FollowRedirects>,
    /// Cap on the request body kept for 307/308 replay, in bytes.
    pub redirect_body_limit: Option<usize>,
    /// Outbound method override.
    pub method: Option<String>,
    /// Extra CA bundle (PEM) for outbound TLS.
    pub ca: Option<String>,
    /// Keep-alive connection pool.
    #[serde(skip)]
    pub agent: Option<Agent>,
    /// Listener TLS.
    pub ssl: Option<ListenerTls>,
    /// Serve HTTP/2 with HTTP/1.1 fallback when listening.
    pub http2: Option<bool>,
}

macro_rules! merge_fields {
    ($call:ident, $defaults:ident, $($field:ident),+ $(,)?) => {
        ProxyOptions {
            $($field: $call.$field.or_else(|| $defaults.$field.clone()),)+
        }
    };
}

impl ProxyOptions {
    /// Options proxying to a single URL.
    pub fn for_target(url: &str) -> Result<Self, ProxyError> {
        Ok(Self {
            target: Some(url.parse()?),
            ..Default::default()
        })
    }

    /// Overlay `self` (per-call) on `defaults`; every set key in `self` wins.
    pub fn merged_over(self, defaults: &ProxyOptions) -> ProxyOptions {
        let call = self;
        merge_fields!(
            call,
            defaults,
            target,
            forward,
            ws,
            xfwd,
            secure,
            to_proxy,
            prepend_path,
            ignore_path,
            local_address,
            change_origin,
            preserve_header_key_case,
            auth,
            host_rewrite,
            auto_rewrite,
            protocol_rewrite,
            cookie_domain_rewrite,
            cookie_path_rewrite,
            headers,
            proxy_timeout,
            timeout,
            self_handle_response,
            buffer,
            follow_redirects,
            redirect_body_limit,
            method,
            ca,
            agent,
            ssl,
            http2,
        )
    }

    pub fn ws_enabled(&self) -> bool {
        self.ws.unwrap_or(false)
    }

    pub fn xfwd_enabled(&self) -> bool {
        self.xfwd.unwrap_or(false)
    }

    pub fn prepend_path_enabled(&self) -> bool {
        self.prepend_path.unwrap_or(true)
    }

    pub fn self_handles_response(&self) -> bool {
        self.self_handle_response.unwrap_or(false)
    }

    pub fn preserves_header_case(&self) -> bool {
        self.preserve_header_key_case.unwrap_or(false)
    }

    /// Redirect hops to follow; zero when following is off.
    pub fn max_redirects(&self) -> u32 {
        self.follow_redirects.map(FollowRedirects::max_hops).unwrap_or(0)
    }

    pub fn redirect_body_limit(&self) -> usize {
        self.redirect_body_limit.unwrap_or(DEFAULT_REDIRECT_BODY_LIMIT)
    }

    pub fn proxy_timeout(&self) -> Option<Duration> {
        self.proxy_timeout.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub fn inbound_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub fn cookie_domain_rule(&self) -> Option<&CookieRewrite> {
        self.cookie_domain_rewrite.as_ref().filter(|r| r.is_enabled())
    }

    pub fn cookie_path_rule(&self) -> Option<&CookieRewrite> {
        self.cookie_path_rewrite.as_ref().filter(|r| r.is_enabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_url_string() {
        let target: Target = "https://mycouch.com:6984/base".parse().unwrap();
        assert_eq!(target.protocol.as_deref(), Some("https:"));
        assert_eq!(target.host.as_deref(), Some("mycouch.com:6984"));
        assert_eq!(target.hostname.as_deref(), Some("mycouch.com"));
        assert_eq!(target.port, Some(6984));
        assert_eq!(target.path.as_deref(), Some("/base"));
        assert!(target.is_secure());
    }

    #[test]
    fn test_target_default_port_is_omitted() {
        let target: Target = "http://main".parse().unwrap();
        assert_eq!(target.host.as_deref(), Some("main"));
        assert_eq!(target.port, None);
        assert_eq!(target.path.as_deref(), Some("/"));
        assert_eq!(target.to_url().unwrap().as_str(), "http://main/");
    }

    #[test]
    fn test_target_from_toml_table() {
        #[derive(Deserialize)]
        struct Wrapper {
            target: Target,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            [target]
            host = "localhost"
            port = 8443
            protocol = "https"
            servername = "api.internal"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.target.protocol.as_deref(), Some("https:"));
        assert_eq!(parsed.target.port, Some(8443));
        assert_eq!(parsed.target.tls.servername.as_deref(), Some("api.internal"));
        assert_eq!(parsed.target.to_url().unwrap().as_str(), "https://localhost:8443/");
    }

    #[test]
    fn test_target_table_needs_host_or_socket() {
        let spec = TargetSpec::Detailed(TargetFields { port: Some(80), ..Default::default() });
        assert!(Target::try_from(spec).is_err());
    }

    #[test]
    fn test_is_ssl_pattern() {
        assert!(is_ssl("https:"));
        assert!(is_ssl("https"));
        assert!(is_ssl("wss:"));
        assert!(!is_ssl("http:"));
        assert!(!is_ssl("ws"));
    }

    #[test]
    fn test_merge_call_level_wins() {
        let defaults = ProxyOptions {
            target: Some("http://default".parse().unwrap()),
            xfwd: Some(true),
            change_origin: Some(true),
            ..Default::default()
        };
        let call = ProxyOptions {
            target: Some("http://override".parse().unwrap()),
            change_origin: Some(false),
            ..Default::default()
        };
        let merged = call.merged_over(&defaults);
        assert_eq!(merged.target.as_ref().unwrap().hostname.as_deref(), Some("override"));
        assert_eq!(merged.change_origin, Some(false));
        assert!(merged.xfwd_enabled());
        assert!(merged.prepend_path_enabled());
    }

    #[test]
    fn test_follow_redirects() {
        assert_eq!(ProxyOptions::default().max_redirects(), 0);
        let opts = ProxyOptions {
            follow_redirects: Some(FollowRedirects::Enabled(true)),
            ..Default::default()
        };
        assert_eq!(opts.max_redirects(), DEFAULT_MAX_REDIRECTS);
        let opts = ProxyOptions {
            follow_redirects: Some(FollowRedirects::Limit(2)),
            ..Default::default()
        };
        assert_eq!(opts.max_redirects(), 2);
    }

    #[test]
    fn test_cookie_rewrite_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            a: CookieRewrite,
            b: CookieRewrite,
            c: CookieRewrite,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            a = false
            b = "new.com"
            c = { "old.com" = "new.com", "*" = "" }
            "#,
        )
        .unwrap();
        assert_eq!(parsed.a, CookieRewrite::Disabled);
        assert_eq!(parsed.b.lookup("anything"), Some("new.com"));
        assert_eq!(parsed.c.lookup("old.com"), Some("new.com"));
        assert_eq!(parsed.c.lookup("other.com"), Some(""));
    }
}
