//! WebSocket upgrade proxying without a server.
//!
//! Same handshake and piping as the `ws` pipeline's stream pass, for
//! callers that hold an upgrade request and its socket themselves.

use std::collections::BTreeMap;
use std::net::IpAddr;

use bytes::Bytes;
use hyper::header::UPGRADE;
use hyper::Method;

use crate::config::schema::{ProxyOptions, Target};
use crate::error::ProxyError;
use crate::http::body;
use crate::http::middleware::append_forwarded;
use crate::http::outgoing::{setup_outgoing, TargetSlot};
use crate::http::request::{ProxyRequest, RequestHead};
use crate::http::tunnel::{self, Handshake, Tunnel};
use crate::net::address::ProxyAddr;
use crate::net::socket::ClientSocket;
use crate::net::transport::Agent;

/// Options for [`proxy_upgrade`].
#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    /// Add `x-forwarded-*` headers (`ws`/`wss` as protocol).
    pub xfwd: bool,
    pub change_origin: bool,
    pub headers: BTreeMap<String, String>,
    /// Verify upstream TLS certificates (default true).
    pub secure: Option<bool>,
    pub agent: Option<Agent>,
    pub local_address: Option<IpAddr>,
    /// Basic auth credentials, `user:pass`.
    pub auth: Option<String>,
    /// Default true.
    pub prepend_path: Option<bool>,
    pub ignore_path: bool,
    pub to_proxy: bool,
}

impl UpgradeOptions {
    fn into_proxy_options(self, target: Target) -> ProxyOptions {
        ProxyOptions {
            target: Some(target),
            change_origin: Some(self.change_origin),
            headers: (!self.headers.is_empty()).then_some(self.headers),
            secure: self.secure,
            agent: self.agent,
            local_address: self.local_address,
            auth: self.auth,
            prepend_path: Some(self.prepend_path.unwrap_or(true)),
            ignore_path: Some(self.ignore_path),
            to_proxy: Some(self.to_proxy),
            ..Default::default()
        }
    }
}

/// Proxy the upgrade request `req` arriving on `socket` to `addr`.
///
/// Resolves with the running tunnel once the upstream switched protocols.
/// An invalid upgrade request destroys the socket, a failed upstream
/// handshake ends it gracefully; a non-101 upstream
/// answer is relayed to the client and reported as
/// [`ProxyError::UpgradeDeclined`].
pub async fn proxy_upgrade<A>(
    addr: A,
    req: &mut ProxyRequest,
    socket: &mut ClientSocket,
    head: Bytes,
    opts: UpgradeOptions,
) -> Result<Tunnel, ProxyError>
where
    A: TryInto<ProxyAddr>,
    ProxyError: From<A::Error>,
{
    let addr: ProxyAddr = addr.try_into()?;

    if !is_websocket_upgrade(&req.head) {
        socket.destroy();
        return Err(ProxyError::InvalidUpgrade);
    }
    if opts.xfwd {
        let proto = if req.head.encrypted { "wss" } else { "ws" };
        append_forwarded(&mut req.head, proto);
    }

    let options = opts.into_proxy_options(target_for(&addr));
    let desc = setup_outgoing(&options, &req.head, TargetSlot::Target)?;
    let request = desc.to_request(body::empty())?;

    match tunnel::handshake(&desc, request, socket, head).await {
        Ok(Handshake::Upgraded { info, client, upstream }) => {
            tracing::debug!(endpoint = %info.endpoint, "Standalone tunnel established");
            Ok(Tunnel::spawn(info, client, upstream))
        }
        Ok(Handshake::Declined(status)) => Err(ProxyError::UpgradeDeclined(status)),
        Err(e) => {
            socket.end().await;
            Err(e)
        }
    }
}

fn is_websocket_upgrade(head: &RequestHead) -> bool {
    head.method == Method::GET
        && head
            .header_str(UPGRADE)
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
}

/// Plain-HTTP target for `addr`.
fn target_for(addr: &ProxyAddr) -> Target {
    match addr {
        ProxyAddr::Tcp { host, port } => {
            let authority_host = if host.contains(':') { format!("[{}]", host) } else { host.clone() };
            Target {
                protocol: Some("http:".to_string()),
                host: Some(format!("{}:{}", authority_host, port)),
                hostname: Some(host.clone()),
                port: Some(*port),
                ..Default::default()
            }
        }
        ProxyAddr::Unix(path) => Target {
            protocol: Some("http:".to_string()),
            socket_path: Some(path.clone()),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{CONNECTION, HOST};

    fn upgrade_request(method: Method) -> ProxyRequest {
        let mut head = RequestHead::new(method, "/socket?room=1".parse().unwrap());
        head.headers.insert(UPGRADE, "websocket".parse().unwrap());
        head.headers.insert(CONNECTION, "Upgrade".parse().unwrap());
        head.headers.insert(HOST, "proxy.local".parse().unwrap());
        ProxyRequest::from_head(head)
    }

    #[tokio::test]
    async fn test_invalid_request_destroys_socket() {
        let (stream, _peer) = tokio::io::duplex(64);
        let mut socket = ClientSocket::from_stream(stream);
        let mut req = upgrade_request(Method::POST);
        let err = proxy_upgrade("http://127.0.0.1:1", &mut req, &mut socket, Bytes::new(), UpgradeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidUpgrade));
        assert!(socket.is_destroyed());
    }

    #[test]
    fn test_outgoing_request_for_tcp_addr() {
        let addr: ProxyAddr = "ws://127.0.0.1:9001".parse().unwrap();
        let opts = UpgradeOptions {
            change_origin: true,
            ..Default::default()
        };
        let options = opts.into_proxy_options(target_for(&addr));
        let req = upgrade_request(Method::GET);
        let desc = setup_outgoing(&options, &req.head, TargetSlot::Target).unwrap();
        assert_eq!(desc.endpoint(), "127.0.0.1:9001");
        assert_eq!(desc.path, "/socket?room=1");
        assert_eq!(desc.headers[HOST], "127.0.0.1:9001");
        assert_eq!(desc.headers[CONNECTION], "Upgrade");
        assert!(!desc.is_secure());
    }

    #[test]
    fn test_unix_target() {
        let target = target_for(&ProxyAddr::Unix("/run/app.sock".into()));
        assert_eq!(target.socket_path.as_deref(), Some(std::path::Path::new("/run/app.sock")));
        assert_eq!(target.protocol_or_default(), "http:");
    }
}
