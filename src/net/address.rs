//! Proxy address resolution.
//!
//! Turns the address forms accepted by the standalone helpers into a
//! canonical [`ProxyAddr`]. No network I/O happens here.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ProxyError;

/// A resolved upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyAddr {
    /// TCP endpoint.
    Tcp { host: String, port: u16 },
    /// Unix domain socket.
    Unix(PathBuf),
}

/// Object form of an address: `{ host, port }` or `{ socket_path }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AddrSpec {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub socket_path: Option<PathBuf>,
}

impl ProxyAddr {
    /// The value to put in a `Host` header when the caller supplied none.
    pub fn host_header(&self) -> String {
        match self {
            ProxyAddr::Tcp { host, port } => format!("{}:{}", host, port),
            ProxyAddr::Unix(_) => "localhost".to_string(),
        }
    }
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyAddr::Tcp { host, port } => write!(f, "{}:{}", host, port),
            ProxyAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Parse a string address: `unix:/path`, or a URL such as `http://host:port`
/// or `wss://host` (default ports follow the scheme).
pub fn parse_addr(input: &str) -> Result<ProxyAddr, ProxyError> {
    if let Some(path) = input.strip_prefix("unix:") {
        if path.is_empty() {
            return Err(ProxyError::InvalidAddress(input.to_string()));
        }
        return Ok(ProxyAddr::Unix(PathBuf::from(path)));
    }

    let url = Url::parse(input).map_err(|e| ProxyError::InvalidAddress(format!("{}: {}", input, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::InvalidAddress(format!("{}: missing host", input)))?;
    let port = url
        .port()
        .unwrap_or_else(|| default_port(url.scheme()));

    Ok(ProxyAddr::Tcp {
        host: trim_brackets(host).to_string(),
        port,
    })
}

impl FromStr for ProxyAddr {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_addr(s)
    }
}

impl TryFrom<AddrSpec> for ProxyAddr {
    type Error = ProxyError;

    fn try_from(spec: AddrSpec) -> Result<Self, Self::Error> {
        if let Some(path) = spec.socket_path {
            return Ok(ProxyAddr::Unix(path));
        }
        match spec.port {
            Some(port) => Ok(ProxyAddr::Tcp {
                host: spec.host.unwrap_or_else(|| "localhost".to_string()),
                port,
            }),
            None => Err(ProxyError::InvalidAddress(
                "address needs either a port or a socket path".to_string(),
            )),
        }
    }
}

impl TryFrom<&str> for ProxyAddr {
    type Error = ProxyError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        parse_addr(s)
    }
}

impl From<std::net::SocketAddr> for ProxyAddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        ProxyAddr::Tcp {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" | "wss" => 443,
        _ => 80,
    }
}

fn trim_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_forms() {
        assert_eq!(
            parse_addr("http://localhost:3000").unwrap(),
            ProxyAddr::Tcp { host: "localhost".into(), port: 3000 }
        );
        assert_eq!(
            parse_addr("https://example.com").unwrap(),
            ProxyAddr::Tcp { host: "example.com".into(), port: 443 }
        );
        assert_eq!(
            parse_addr("ws://example.com").unwrap(),
            ProxyAddr::Tcp { host: "example.com".into(), port: 80 }
        );
        assert_eq!(
            parse_addr("wss://[::1]").unwrap(),
            ProxyAddr::Tcp { host: "::1".into(), port: 443 }
        );
    }

    #[test]
    fn test_parse_unix() {
        assert_eq!(
            parse_addr("unix:/tmp/app.sock").unwrap(),
            ProxyAddr::Unix(PathBuf::from("/tmp/app.sock"))
        );
        assert!(parse_addr("unix:").is_err());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(parse_addr("not a url"), Err(ProxyError::InvalidAddress(_))));
    }

    #[test]
    fn test_object_form_requires_port_or_socket() {
        let spec = AddrSpec { host: Some("10.0.0.1".into()), ..Default::default() };
        assert!(matches!(ProxyAddr::try_from(spec), Err(ProxyError::InvalidAddress(_))));

        let spec = AddrSpec { host: Some("10.0.0.1".into()), port: Some(8080), ..Default::default() };
        assert_eq!(
            ProxyAddr::try_from(spec).unwrap(),
            ProxyAddr::Tcp { host: "10.0.0.1".into(), port: 8080 }
        );

        let spec = AddrSpec { socket_path: Some("/run/app.sock".into()), ..Default::default() };
        assert_eq!(
            ProxyAddr::try_from(spec).unwrap(),
            ProxyAddr::Unix(PathBuf::from("/run/app.sock"))
        );
    }

    #[test]
    fn test_host_header() {
        assert_eq!(parse_addr("http://localhost:3000").unwrap().host_header(), "localhost:3000");
        assert_eq!(parse_addr("unix:/tmp/a.sock").unwrap().host_header(), "localhost");
    }
}
