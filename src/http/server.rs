//! The proxy server facade.
//!
//! # Responsibilities
//! - Hold server-wide default options, event listeners and pipelines
//! - Merge per-call options and run the `web`/`ws` pipelines
//! - Splice custom passes into the pipelines (`before`/`after`)
//! - Optionally own a listener (`listen`/`close`)
//!
//! # Design Decisions
//! - Cheap to clone; every clone shares the same listeners and pipelines
//! - Each flow runs inside a `flow` span carrying a UUID `flow_id`
//! - Pipelines are snapshotted when a flow starts; `before`/`after` are
//!   meant for setup time and never affect flows already running

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use bytes::Bytes;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::schema::{ProxyOptions, Target};
use crate::error::ProxyError;
use crate::http::middleware::{
    run_web, run_ws, ErrorCallback, FlowErrors, Named, Pass, Pipelines, Position, WebContext, WebPass, WsContext,
    WsPass,
};
use crate::http::request::{ProxyRequest, RequestHead};
use crate::http::response::ServerResponse;
use crate::net::listener::{self, ListenerHandle};
use crate::net::socket::ClientSocket;
use crate::observability::events::{EventBus, EventKind, ProxyEvent};

/// A reverse proxy with pluggable pipelines and an event surface.
#[derive(Clone)]
pub struct ProxyServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    options: ProxyOptions,
    events: EventBus,
    pipelines: RwLock<Pipelines>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl ProxyServer {
    /// A server whose flows default to `options`.
    pub fn new(options: ProxyOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                options,
                events: EventBus::new(),
                pipelines: RwLock::new(Pipelines::default()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Server-wide default options.
    pub fn options(&self) -> &ProxyOptions {
        &self.inner.options
    }

    /// Register an event listener.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> &Self
    where
        F: Fn(&mut ProxyEvent<'_>) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener);
        self
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.events.listener_count(kind)
    }

    pub(crate) fn emit(&self, event: &mut ProxyEvent<'_>) -> bool {
        self.inner.events.emit(event)
    }

    /// Insert `pass` before the last pass named `pass_name`.
    pub fn before(&self, kind: &str, pass_name: &str, pass: Pass) -> Result<(), ProxyError> {
        self.insert(kind, pass_name, pass, Position::Before)
    }

    /// Insert `pass` after the last pass named `pass_name`.
    pub fn after(&self, kind: &str, pass_name: &str, pass: Pass) -> Result<(), ProxyError> {
        self.insert(kind, pass_name, pass, Position::After)
    }

    fn insert(&self, kind: &str, pass_name: &str, pass: Pass, position: Position) -> Result<(), ProxyError> {
        let mut pipelines = self.inner.pipelines.write().unwrap_or_else(|e| e.into_inner());
        pipelines.insert(kind, pass_name, pass, position)?;
        tracing::debug!(kind, anchor = pass_name, ?position, "Pass inserted");
        Ok(())
    }

    /// Pass names of the `web` or `ws` pipeline, in order.
    pub fn passes(&self, kind: &str) -> Result<Vec<String>, ProxyError> {
        self.pipelines().names(kind)
    }

    fn pipelines(&self) -> RwLockReadGuard<'_, Pipelines> {
        self.inner.pipelines.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Proxy one HTTP request into `res`.
    ///
    /// `options` are merged over the server defaults. Errors go to `error`
    /// listeners when any are registered; otherwise the first one is
    /// returned here.
    pub async fn web(
        &self,
        req: &mut ProxyRequest,
        res: &mut ServerResponse,
        options: Option<ProxyOptions>,
    ) -> Result<(), ProxyError> {
        self.web_flow(req, res, options, None).await
    }

    /// Like [`ProxyServer::web`], with `callback` taking every error of this
    /// flow instead of the `error` listeners.
    pub async fn web_with_callback<F>(
        &self,
        req: &mut ProxyRequest,
        res: &mut ServerResponse,
        options: Option<ProxyOptions>,
        callback: F,
    ) -> Result<(), ProxyError>
    where
        F: Fn(&ProxyError, &RequestHead, Option<&mut ServerResponse>, Option<&Target>) + Send + Sync + 'static,
    {
        self.web_flow(req, res, options, Some(Arc::new(callback))).await
    }

    async fn web_flow(
        &self,
        req: &mut ProxyRequest,
        res: &mut ServerResponse,
        options: Option<ProxyOptions>,
        callback: Option<ErrorCallback>,
    ) -> Result<(), ProxyError> {
        let options = self.merge(options);
        let errors = FlowErrors::new(self.clone(), callback);
        if !has_destination(&options) {
            errors.report(ProxyError::MissingTarget, &req.head, Some(res), None);
            return settle(&errors);
        }

        let passes: Vec<Named<dyn WebPass>> = self.pipelines().web().to_vec();
        let span = flow_span("web", &req.head);
        let mut ctx = WebContext {
            req,
            res,
            options: &options,
            server: self,
            errors: &errors,
        };
        run_web(&passes, &mut ctx).instrument(span).await;
        settle(&errors)
    }

    /// Proxy one upgrade request over `socket`.
    ///
    /// `head` holds bytes the client sent after the request head. Resolves
    /// when the tunnel closes or the upgrade fails.
    pub async fn ws(
        &self,
        req: &mut ProxyRequest,
        socket: &mut ClientSocket,
        options: Option<ProxyOptions>,
        head: Bytes,
    ) -> Result<(), ProxyError> {
        self.ws_flow(req, socket, options, head, None).await
    }

    /// Like [`ProxyServer::ws`], with `callback` taking every error of this
    /// flow instead of the `error` listeners.
    pub async fn ws_with_callback<F>(
        &self,
        req: &mut ProxyRequest,
        socket: &mut ClientSocket,
        options: Option<ProxyOptions>,
        head: Bytes,
        callback: F,
    ) -> Result<(), ProxyError>
    where
        F: Fn(&ProxyError, &RequestHead, Option<&mut ServerResponse>, Option<&Target>) + Send + Sync + 'static,
    {
        self.ws_flow(req, socket, options, head, Some(Arc::new(callback))).await
    }

    async fn ws_flow(
        &self,
        req: &mut ProxyRequest,
        socket: &mut ClientSocket,
        options: Option<ProxyOptions>,
        head: Bytes,
        callback: Option<ErrorCallback>,
    ) -> Result<(), ProxyError> {
        let options = self.merge(options);
        let errors = FlowErrors::new(self.clone(), callback);
        if !has_destination(&options) {
            errors.report(ProxyError::MissingTarget, &req.head, None, None);
            return settle(&errors);
        }

        let passes: Vec<Named<dyn WsPass>> = self.pipelines().ws().to_vec();
        let span = flow_span("ws", &req.head);
        let mut ctx = WsContext {
            req,
            socket,
            options: &options,
            server: self,
            head,
            errors: &errors,
        };
        run_ws(&passes, &mut ctx).instrument(span).await;
        settle(&errors)
    }

    fn merge(&self, options: Option<ProxyOptions>) -> ProxyOptions {
        match options {
            Some(options) => options.merged_over(&self.inner.options),
            None => self.inner.options.clone(),
        }
    }

    /// Bind a listener on `port` and serve every request through this
    /// server. TLS and HTTP/2 follow the `ssl` and `http2` options; upgrades
    /// go to `ws` when the `ws` option is on.
    pub async fn listen(&self, port: u16, hostname: Option<&str>) -> Result<&Self, ProxyError> {
        let handle = listener::bind(self.clone(), port, hostname).await?;
        let previous = self.listener_slot().replace(handle);
        if let Some(previous) = previous {
            tracing::warn!(address = %previous.local_addr(), "Replacing existing listener");
            previous.close().await;
        }
        Ok(self)
    }

    /// Address of the bound listener, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener_slot().as_ref().map(ListenerHandle::local_addr)
    }

    /// Close the listener and wait for its connections to finish. No-op if
    /// not listening.
    pub async fn close(&self) {
        let handle = self.listener_slot().take();
        if let Some(handle) = handle {
            handle.close().await;
        }
    }

    fn listener_slot(&self) -> std::sync::MutexGuard<'_, Option<ListenerHandle>> {
        self.inner.listener.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("events", &self.inner.events)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

fn has_destination(options: &ProxyOptions) -> bool {
    options.target.is_some() || options.forward.is_some()
}

fn settle(errors: &FlowErrors) -> Result<(), ProxyError> {
    match errors.settle() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn flow_span(kind: &'static str, head: &RequestHead) -> tracing::Span {
    tracing::info_span!(
        "flow",
        flow_id = %Uuid::new_v4(),
        kind,
        method = %head.method,
        uri = %head.uri,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::middleware::{web_fn, Flow};
    use hyper::{Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request() -> ProxyRequest {
        ProxyRequest::from_head(RequestHead::new(Method::GET, "/".parse().unwrap()))
    }

    #[tokio::test]
    async fn test_missing_target_without_listener_fails_flow() {
        let server = ProxyServer::new(ProxyOptions::default());
        let err = server
            .web(&mut request(), &mut ServerResponse::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::MissingTarget));
    }

    #[tokio::test]
    async fn test_missing_target_goes_to_error_listener() {
        let server = ProxyServer::new(ProxyOptions::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        server.on(EventKind::Error, move |event| {
            if let ProxyEvent::Error { error, .. } = event {
                assert!(matches!(error, ProxyError::MissingTarget));
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        server.web(&mut request(), &mut ServerResponse::new(), None).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callback_beats_listener() {
        let server = ProxyServer::new(ProxyOptions::default());
        server.on(EventKind::Error, |_| panic!("listener must not run"));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        server
            .web_with_callback(&mut request(), &mut ServerResponse::new(), None, move |_, _, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_halting_pass_stops_pipeline() {
        let server = ProxyServer::new(ProxyOptions::for_target("http://127.0.0.1:1").unwrap());
        let halt = web_fn(|ctx: &mut WebContext<'_>| {
            ctx.res.set_status(StatusCode::FORBIDDEN);
            ctx.res.end();
            Flow::Halt
        });
        server.before("web", "stream", Pass::web("deny", halt)).unwrap();
        assert_eq!(server.passes("web").unwrap(), ["delete_length", "timeout", "x_headers", "deny", "stream"]);

        let mut res = ServerResponse::new();
        server.web(&mut request(), &mut res, None).await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert!(res.is_finished());
    }

    #[tokio::test]
    async fn test_per_call_options_win() {
        let server = ProxyServer::new(ProxyOptions::for_target("http://127.0.0.1:1").unwrap());
        let seen = Arc::new(std::sync::Mutex::new(None));
        let slot = Arc::clone(&seen);
        let capture = web_fn(move |ctx: &mut WebContext<'_>| {
            *slot.lock().unwrap() = ctx.options.target.as_ref().and_then(|t| t.port);
            Flow::Halt
        });
        server.before("web", "stream", Pass::web("capture", capture)).unwrap();

        let call = ProxyOptions::for_target("http://127.0.0.1:2").unwrap();
        server.web(&mut request(), &mut ServerResponse::new(), Some(call)).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_close_without_listen_is_noop() {
        let server = ProxyServer::new(ProxyOptions::default());
        assert!(server.local_addr().is_none());
        server.close().await;
    }
}
