//! HTTP and WebSocket reverse proxy library.
//!
//! A [`ProxyServer`] runs each inbound request through an ordered, editable
//! pipeline of passes and relays it to a target, optionally copying it to a
//! `forward` destination, following redirects and rewriting the response.
//! Upgrade requests go through a separate pipeline that ends in a raw
//! bidirectional tunnel. [`proxy_fetch`] and [`proxy_upgrade`] offer the
//! same relaying without a server.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod standalone;

pub use config::schema::{ProxyOptions, Target};
pub use error::ProxyError;
pub use http::middleware::{web_fn, ws_fn, Flow, Pass, WebContext, WebPass, WsContext, WsPass};
pub use http::cookies::rewrite_cookie_property;
pub use http::outgoing::{has_port, join_url, requires_port, setup_outgoing, OutgoingRequest};
pub use http::tunnel::Tunnel;
pub use http::{ProxyRequest, ProxyServer, RequestHead, ServerResponse};
pub use net::address::{parse_addr, ProxyAddr};
pub use net::socket::ClientSocket;
pub use observability::events::{EventKind, ProxyEvent};
pub use standalone::{proxy_fetch, proxy_upgrade, FetchInit, FetchInput, UpgradeOptions};
