//! Proxy event registry.
//!
//! # Data Flow
//! ```text
//! pipeline pass / tunnel
//!     → EventBus::emit(&mut ProxyEvent)
//!     → every listener registered for that EventKind, in registration order
//! ```
//!
//! # Design Decisions
//! - Listeners get `&mut ProxyEvent` so `proxyReq`/`proxyRes` listeners can
//!   edit the outbound request or the client response in place
//! - Listener lists are cloned out of the map before calling, so a listener
//!   may register further listeners without deadlocking

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use hyper::{Request, Response, StatusCode};

use crate::config::schema::{ProxyOptions, Target};
use crate::error::ProxyError;
use crate::http::body::ProxyBody;
use crate::http::request::RequestHead;
use crate::http::response::ServerResponse;
use crate::http::tunnel::TunnelInfo;

/// Event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    ProxyReq,
    ProxyReqWs,
    ProxyRes,
    End,
    Econnreset,
    Error,
    Open,
    /// Deprecated alias of [`EventKind::Open`], still emitted.
    ProxySocket,
    Close,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::ProxyReq => "proxyReq",
            EventKind::ProxyReqWs => "proxyReqWs",
            EventKind::ProxyRes => "proxyRes",
            EventKind::End => "end",
            EventKind::Econnreset => "econnreset",
            EventKind::Error => "error",
            EventKind::Open => "open",
            EventKind::ProxySocket => "proxySocket",
            EventKind::Close => "close",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event published by a proxy flow.
pub enum ProxyEvent<'a> {
    /// The stream pass is about to contact the upstream.
    Start {
        req: &'a RequestHead,
        target: &'a Target,
    },
    /// Outbound web request, before it is sent.
    ProxyReq {
        proxy_req: &'a mut Request<ProxyBody>,
        req: &'a RequestHead,
        res: &'a ServerResponse,
        options: &'a ProxyOptions,
    },
    /// Outbound upgrade request, before it is sent.
    ProxyReqWs {
        proxy_req: &'a mut Request<ProxyBody>,
        req: &'a RequestHead,
        options: &'a ProxyOptions,
        head: &'a Bytes,
    },
    /// Upstream response, before it is relayed.
    ProxyRes {
        proxy_res: &'a mut Response<ProxyBody>,
        req: &'a RequestHead,
        res: &'a mut ServerResponse,
    },
    /// The upstream response was fully relayed.
    End {
        req: &'a RequestHead,
        status: StatusCode,
    },
    /// The client was already gone when the exchange failed.
    Econnreset {
        error: &'a ProxyError,
        req: &'a RequestHead,
        target: Option<&'a Target>,
    },
    Error {
        error: &'a ProxyError,
        req: Option<&'a RequestHead>,
        res: Option<&'a mut ServerResponse>,
        target: Option<&'a Target>,
    },
    /// A WebSocket tunnel was established.
    Open { tunnel: &'a TunnelInfo },
    ProxySocket { tunnel: &'a TunnelInfo },
    /// The upstream side of a tunnel ended.
    Close {
        req: &'a RequestHead,
        tunnel: &'a TunnelInfo,
    },
}

impl ProxyEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            ProxyEvent::Start { .. } => EventKind::Start,
            ProxyEvent::ProxyReq { .. } => EventKind::ProxyReq,
            ProxyEvent::ProxyReqWs { .. } => EventKind::ProxyReqWs,
            ProxyEvent::ProxyRes { .. } => EventKind::ProxyRes,
            ProxyEvent::End { .. } => EventKind::End,
            ProxyEvent::Econnreset { .. } => EventKind::Econnreset,
            ProxyEvent::Error { .. } => EventKind::Error,
            ProxyEvent::Open { .. } => EventKind::Open,
            ProxyEvent::ProxySocket { .. } => EventKind::ProxySocket,
            ProxyEvent::Close { .. } => EventKind::Close,
        }
    }
}

/// A registered event listener.
pub type Listener = Arc<dyn Fn(&mut ProxyEvent<'_>) + Send + Sync>;

/// Listener registry keyed by [`EventKind`].
#[derive(Default)]
pub struct EventBus {
    listeners: DashMap<EventKind, Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&mut ProxyEvent<'_>) + Send + Sync + 'static,
    {
        self.listeners.entry(kind).or_default().push(Arc::new(listener));
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map(|l| l.len()).unwrap_or(0)
    }

    /// Call every listener of the event's kind. Returns whether any ran.
    pub fn emit(&self, event: &mut ProxyEvent<'_>) -> bool {
        let kind = event.kind();
        let listeners: Vec<Listener> = match self.listeners.get(&kind) {
            Some(registered) => registered.clone(),
            None => Vec::new(),
        };
        tracing::trace!(event = %kind, listeners = listeners.len(), "Emitting proxy event");
        for listener in &listeners {
            listener(event);
        }
        !listeners.is_empty()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for entry in self.listeners.iter() {
            map.entry(&entry.key().as_str(), &entry.value().len());
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_listener_count() {
        let bus = EventBus::new();
        assert_eq!(bus.listener_count(EventKind::Error), 0);
        bus.on(EventKind::Error, |_| {});
        bus.on(EventKind::Error, |_| {});
        assert_eq!(bus.listener_count(EventKind::Error), 2);
        assert_eq!(bus.listener_count(EventKind::End), 0);
    }

    #[test]
    fn test_emit_reaches_only_matching_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        bus.on(EventKind::End, move |event| {
            if let ProxyEvent::End { status, .. } = event {
                assert_eq!(*status, StatusCode::OK);
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let req = RequestHead::new(Method::GET, "/".parse().unwrap());
        let target: Target = "http://localhost".parse().unwrap();
        assert!(!bus.emit(&mut ProxyEvent::Start { req: &req, target: &target }));
        assert!(bus.emit(&mut ProxyEvent::End { req: &req, status: StatusCode::OK }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_mutate_response() {
        let bus = EventBus::new();
        bus.on(EventKind::ProxyRes, |event| {
            if let ProxyEvent::ProxyRes { proxy_res, .. } = event {
                proxy_res.headers_mut().insert("x-seen", "1".parse().unwrap());
            }
        });

        let req = RequestHead::new(Method::GET, "/".parse().unwrap());
        let mut res = ServerResponse::new();
        let mut proxy_res = Response::new(crate::http::body::empty());
        bus.emit(&mut ProxyEvent::ProxyRes {
            proxy_res: &mut proxy_res,
            req: &req,
            res: &mut res,
        });
        assert_eq!(proxy_res.headers()["x-seen"], "1");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EventKind::ProxyReqWs.to_string(), "proxyReqWs");
        assert_eq!(EventKind::Econnreset.as_str(), "econnreset");
    }
}
