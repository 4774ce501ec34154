//! Default passes of the ws pipeline.
//!
//! # Data Flow
//! ```text
//! check_method_and_header → x_headers → stream
//!                                         → proxyReqWs → upgrade handshake
//!                                              ├─ 101: open, proxySocket → pipe → close
//!                                              └─ other: response relayed to the socket
//! ```
//!
//! # Design Decisions
//! - The stream pass owns the tunnel until both directions end, so a `ws`
//!   flow resolves when the connection closes
//! - A rejected request destroys the client socket; an upstream failure
//!   before the tunnel opens ends it gracefully after reporting

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hyper::header::UPGRADE;
use hyper::Method;

use super::{append_forwarded, Flow, Named, WsContext, WsPass};
use crate::http::body;
use crate::http::outgoing::{setup_outgoing, TargetSlot};
use crate::http::tunnel::{self, Handshake};
use crate::observability::events::ProxyEvent;
use crate::observability::metrics;

pub(crate) fn default_passes() -> Vec<Named<dyn WsPass>> {
    vec![
        named("check_method_and_header", CheckMethodAndHeader),
        named("x_headers", XHeaders),
        named("stream", Stream),
    ]
}

fn named(name: &str, pass: impl WsPass + 'static) -> Named<dyn WsPass> {
    Named {
        name: name.to_string(),
        pass: Arc::new(pass),
    }
}

/// Only `GET` with `Upgrade: websocket` may pass.
pub struct CheckMethodAndHeader;

#[async_trait]
impl WsPass for CheckMethodAndHeader {
    async fn run(&self, ctx: &mut WsContext<'_>) -> Flow {
        let head = &ctx.req.head;
        let is_websocket = head
            .header_str(UPGRADE)
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        if head.method != Method::GET || !is_websocket {
            tracing::debug!(method = %head.method, "Rejecting non-websocket upgrade");
            ctx.socket.destroy();
            return Flow::Halt;
        }
        Flow::Continue
    }
}

/// Appends `x-forwarded-*` headers with `ws`/`wss` as protocol.
pub struct XHeaders;

#[async_trait]
impl WsPass for XHeaders {
    async fn run(&self, ctx: &mut WsContext<'_>) -> Flow {
        if !ctx.options.xfwd_enabled() {
            return Flow::Continue;
        }
        let head = &mut ctx.req.head;
        let proto = if head.encrypted { "wss" } else { "ws" };
        append_forwarded(head, proto);
        Flow::Continue
    }
}

/// Performs the upstream handshake and pipes the tunnel.
pub struct Stream;

#[async_trait]
impl WsPass for Stream {
    async fn run(&self, ctx: &mut WsContext<'_>) -> Flow {
        let options = ctx.options;
        let target = options.target.as_ref();
        metrics::record_flow_started("ws");
        let started = Instant::now();

        let prepared = setup_outgoing(options, &ctx.req.head, TargetSlot::Target)
            .and_then(|desc| desc.to_request(body::empty()).map(|request| (desc, request)));
        let (desc, mut request) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                ctx.errors.report(e, &ctx.req.head, None, target);
                ctx.socket.end().await;
                return Flow::Continue;
            }
        };

        ctx.server.emit(&mut ProxyEvent::ProxyReqWs {
            proxy_req: &mut request,
            req: &ctx.req.head,
            options,
            head: &ctx.head,
        });

        let handshake = tunnel::handshake(&desc, request, &mut *ctx.socket, ctx.head.clone()).await;
        let (info, client, upstream) = match handshake {
            Ok(Handshake::Upgraded { info, client, upstream }) => (info, client, upstream),
            Ok(Handshake::Declined(status)) => {
                metrics::record_tunnel("declined");
                tracing::debug!(status = %status, "Upgrade declined, response relayed");
                return Flow::Continue;
            }
            Err(e) => {
                metrics::record_tunnel("failed");
                ctx.errors.report(e, &ctx.req.head, None, target);
                ctx.socket.end().await;
                return Flow::Continue;
            }
        };

        metrics::record_upstream_response("ws", started);
        metrics::record_tunnel("open");
        ctx.server.emit(&mut ProxyEvent::Open { tunnel: &info });
        ctx.server.emit(&mut ProxyEvent::ProxySocket { tunnel: &info });

        let server = ctx.server.clone();
        let req = ctx.req.head.clone();
        let closed = info.clone();
        let outcome = tunnel::pipe(client, upstream, move || {
            server.emit(&mut ProxyEvent::Close {
                req: &req,
                tunnel: &closed,
            });
        })
        .await;

        tracing::debug!(
            endpoint = %info.endpoint,
            to_upstream = outcome.to_upstream.as_ref().ok(),
            to_client = outcome.to_client.as_ref().ok(),
            "Tunnel closed"
        );
        if let Err(e) = outcome.to_client {
            ctx.errors.report(e.into(), &ctx.req.head, None, target);
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ProxyOptions;
    use crate::http::middleware::FlowErrors;
    use crate::http::request::{ProxyRequest, RequestHead};
    use crate::http::server::ProxyServer;
    use crate::net::socket::ClientSocket;
    use bytes::Bytes;
    use hyper::header::HOST;
    use tokio::io::AsyncReadExt;

    async fn run_pass<P: WsPass>(pass: P, head: RequestHead, options: ProxyOptions) -> (Flow, RequestHead, bool) {
        let (stream, _peer) = tokio::io::duplex(64);
        let (flow, head, socket) = run_pass_on(pass, head, options, stream).await;
        (flow, head, socket.is_destroyed())
    }

    async fn run_pass_on<P: WsPass>(
        pass: P,
        head: RequestHead,
        options: ProxyOptions,
        stream: tokio::io::DuplexStream,
    ) -> (Flow, RequestHead, ClientSocket) {
        let server = ProxyServer::new(ProxyOptions::default());
        let errors = FlowErrors::new(server.clone(), None);
        let mut socket = ClientSocket::from_stream(stream);
        let mut req = ProxyRequest::from_head(head);
        let flow = {
            let mut ctx = WsContext {
                req: &mut req,
                socket: &mut socket,
                options: &options,
                server: &server,
                head: Bytes::new(),
                errors: &errors,
            };
            pass.run(&mut ctx).await
        };
        (flow, req.head, socket)
    }

    fn upgrade_head(method: Method, upgrade: &str) -> RequestHead {
        let mut head = RequestHead::new(method, "/chat".parse().unwrap());
        head.headers.insert(UPGRADE, upgrade.parse().unwrap());
        head.headers.insert(HOST, "proxy.local".parse().unwrap());
        head
    }

    #[tokio::test]
    async fn test_accepts_websocket_get() {
        let (flow, _, destroyed) =
            run_pass(CheckMethodAndHeader, upgrade_head(Method::GET, "WebSocket"), ProxyOptions::default()).await;
        assert_eq!(flow, Flow::Continue);
        assert!(!destroyed);
    }

    #[tokio::test]
    async fn test_rejects_wrong_method_or_protocol() {
        let (flow, _, destroyed) =
            run_pass(CheckMethodAndHeader, upgrade_head(Method::POST, "websocket"), ProxyOptions::default()).await;
        assert_eq!(flow, Flow::Halt);
        assert!(destroyed);

        let (flow, _, destroyed) =
            run_pass(CheckMethodAndHeader, upgrade_head(Method::GET, "h2c"), ProxyOptions::default()).await;
        assert_eq!(flow, Flow::Halt);
        assert!(destroyed);
    }

    #[tokio::test]
    async fn test_x_headers_use_ws_protocols() {
        let options = ProxyOptions {
            xfwd: Some(true),
            ..Default::default()
        };
        let mut head = upgrade_head(Method::GET, "websocket");
        head.remote_addr = Some("127.0.0.1:9000".parse().unwrap());
        let (_, head, _) = run_pass(XHeaders, head, options.clone()).await;
        assert_eq!(head.headers["x-forwarded-proto"], "ws");
        assert_eq!(head.headers["x-forwarded-for"], "127.0.0.1");
        assert!(!head.headers.contains_key("x-forwarded-host"));

        let mut head = upgrade_head(Method::GET, "websocket");
        head.encrypted = true;
        let (_, head, _) = run_pass(XHeaders, head, options).await;
        assert_eq!(head.headers["x-forwarded-proto"], "wss");
    }

    #[tokio::test]
    async fn test_stream_without_target_ends_socket() {
        let (stream, mut peer) = tokio::io::duplex(64);
        let (flow, _, socket) =
            run_pass_on(Stream, upgrade_head(Method::GET, "websocket"), ProxyOptions::default(), stream).await;
        assert_eq!(flow, Flow::Continue);
        assert!(!socket.is_destroyed());

        let mut buf = Vec::new();
        assert_eq!(peer.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refused_upstream_ends_socket() {
        let options = ProxyOptions::for_target("http://127.0.0.1:1").unwrap();
        let (stream, mut peer) = tokio::io::duplex(64);
        let (flow, _, socket) =
            run_pass_on(Stream, upgrade_head(Method::GET, "websocket"), options, stream).await;
        assert_eq!(flow, Flow::Continue);
        assert!(!socket.is_destroyed());

        let mut buf = Vec::new();
        assert_eq!(peer.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
