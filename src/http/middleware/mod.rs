//! Proxy pipelines.
//!
//! # Data Flow
//! ```text
//! web: delete_length → timeout → x_headers → stream ─┐
//!                                                    └→ web_outgoing passes
//! ws:  check_method_and_header → x_headers → stream
//! ```
//!
//! # Responsibilities
//! - Ordered, name-addressed pass lists with `before`/`after` insertion
//! - Per-flow contexts handed to every pass
//! - Error dispatch: callback, then `error` listeners, then the flow result
//!
//! # Design Decisions
//! - A pass returns [`Flow::Halt`] to stop the pipeline; later passes,
//!   including `stream`, do not run
//! - Insertion looks up the *last* pass with the given name; anonymous
//!   passes share the empty name
//! - Flows run against a snapshot of the list, so inserting passes only
//!   affects flows started afterwards

pub mod web_incoming;
pub mod web_outgoing;
pub mod ws_incoming;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;

use crate::config::schema::{ProxyOptions, Target};
use crate::error::ProxyError;
use crate::http::request::{ProxyRequest, RequestHead};
use crate::http::response::ServerResponse;
use crate::http::server::ProxyServer;
use crate::net::socket::ClientSocket;
use crate::observability::events::{EventKind, ProxyEvent};
use crate::observability::metrics;

/// What the pipeline does after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Halt,
}

/// Per-call error handler; takes precedence over `error` listeners.
pub type ErrorCallback =
    Arc<dyn Fn(&ProxyError, &RequestHead, Option<&mut ServerResponse>, Option<&Target>) + Send + Sync>;

/// Error routing for one flow.
#[derive(Clone)]
pub struct FlowErrors {
    server: ProxyServer,
    callback: Option<ErrorCallback>,
    unhandled: Arc<Mutex<Option<ProxyError>>>,
    settled: Arc<AtomicBool>,
}

impl FlowErrors {
    pub(crate) fn new(server: ProxyServer, callback: Option<ErrorCallback>) -> Self {
        Self {
            server,
            callback,
            unhandled: Arc::new(Mutex::new(None)),
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Route `error` to the callback, the `error` listeners, or the flow
    /// result, in that order. Only the first unhandled error is kept.
    pub fn report(
        &self,
        error: ProxyError,
        req: &RequestHead,
        res: Option<&mut ServerResponse>,
        target: Option<&Target>,
    ) {
        metrics::record_upstream_error(error.kind());

        if let Some(callback) = &self.callback {
            callback(&error, req, res, target);
            return;
        }
        if self.server.listener_count(EventKind::Error) > 0 {
            self.server.emit(&mut ProxyEvent::Error {
                error: &error,
                req: Some(req),
                res,
                target,
            });
            return;
        }

        if self.settled.load(Ordering::SeqCst) {
            tracing::warn!(error = %error, "Error reported after the flow settled");
            return;
        }
        let Ok(mut slot) = self.unhandled.lock() else {
            return;
        };
        if slot.is_none() {
            tracing::debug!(error = %error, "Flow failed without an error handler");
            *slot = Some(error);
        } else {
            tracing::warn!(error = %error, "Dropping error after flow already failed");
        }
    }

    /// Report a failure of the exchange with `target`. If the client socket
    /// is already gone and the failure is a reset, only `econnreset` is
    /// emitted.
    pub fn report_upstream(
        &self,
        error: ProxyError,
        req: &RequestHead,
        client_gone: bool,
        res: Option<&mut ServerResponse>,
        target: Option<&Target>,
    ) {
        if client_gone && error.is_connection_reset() {
            metrics::record_upstream_error(error.kind());
            self.server.emit(&mut ProxyEvent::Econnreset {
                error: &error,
                req,
                target,
            });
            return;
        }
        self.report(error, req, res, target);
    }

    /// Settle the flow and return its unhandled error, if any. Errors
    /// reported afterwards are only logged.
    pub(crate) fn settle(&self) -> Option<ProxyError> {
        self.settled.store(true, Ordering::SeqCst);
        self.unhandled.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl std::fmt::Debug for FlowErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowErrors")
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// State of one `web` flow, handed to every pass.
pub struct WebContext<'a> {
    pub req: &'a mut ProxyRequest,
    pub res: &'a mut ServerResponse,
    pub options: &'a ProxyOptions,
    pub server: &'a ProxyServer,
    pub errors: &'a FlowErrors,
}

/// State of one `ws` flow, handed to every pass.
pub struct WsContext<'a> {
    pub req: &'a mut ProxyRequest,
    pub socket: &'a mut ClientSocket,
    pub options: &'a ProxyOptions,
    pub server: &'a ProxyServer,
    /// Bytes the client sent after the upgrade request head.
    pub head: Bytes,
    pub errors: &'a FlowErrors,
}

/// A step of the web pipeline.
#[async_trait]
pub trait WebPass: Send + Sync {
    async fn run(&self, ctx: &mut WebContext<'_>) -> Flow;
}

/// A step of the ws pipeline.
#[async_trait]
pub trait WsPass: Send + Sync {
    async fn run(&self, ctx: &mut WsContext<'_>) -> Flow;
}

/// Synchronous closure used as a pass, see [`web_fn`] and [`ws_fn`].
pub struct FnPass<F>(F);

#[async_trait]
impl<F> WebPass for FnPass<F>
where
    F: Fn(&mut WebContext<'_>) -> Flow + Send + Sync,
{
    async fn run(&self, ctx: &mut WebContext<'_>) -> Flow {
        (self.0)(ctx)
    }
}

#[async_trait]
impl<F> WsPass for FnPass<F>
where
    F: Fn(&mut WsContext<'_>) -> Flow + Send + Sync,
{
    async fn run(&self, ctx: &mut WsContext<'_>) -> Flow {
        (self.0)(ctx)
    }
}

/// Web pass from a closure.
pub fn web_fn<F>(f: F) -> FnPass<F>
where
    F: Fn(&mut WebContext<'_>) -> Flow + Send + Sync,
{
    FnPass(f)
}

/// Ws pass from a closure.
pub fn ws_fn<F>(f: F) -> FnPass<F>
where
    F: Fn(&mut WsContext<'_>) -> Flow + Send + Sync,
{
    FnPass(f)
}

/// A named pass for either pipeline.
#[derive(Clone)]
pub struct Pass {
    name: String,
    step: Step,
}

#[derive(Clone)]
enum Step {
    Web(Arc<dyn WebPass>),
    Ws(Arc<dyn WsPass>),
}

impl Pass {
    pub fn web(name: impl Into<String>, pass: impl WebPass + 'static) -> Self {
        Self {
            name: name.into(),
            step: Step::Web(Arc::new(pass)),
        }
    }

    pub fn ws(name: impl Into<String>, pass: impl WsPass + 'static) -> Self {
        Self {
            name: name.into(),
            step: Step::Ws(Arc::new(pass)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        match self.step {
            Step::Web(_) => "web",
            Step::Ws(_) => "ws",
        }
    }
}

impl std::fmt::Debug for Pass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pass")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}

/// A pass together with the name it is addressed by.
pub struct Named<P: ?Sized> {
    pub name: String,
    pub pass: Arc<P>,
}

impl<P: ?Sized> Clone for Named<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            pass: Arc::clone(&self.pass),
        }
    }
}

/// Where `before`/`after` put the new pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Before,
    After,
}

/// The web and ws pass lists of a server.
#[derive(Clone)]
pub struct Pipelines {
    web: Vec<Named<dyn WebPass>>,
    ws: Vec<Named<dyn WsPass>>,
}

impl Default for Pipelines {
    fn default() -> Self {
        Self {
            web: web_incoming::default_passes(),
            ws: ws_incoming::default_passes(),
        }
    }
}

impl Pipelines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `pass` before or after the last pass named `pass_name` in
    /// the `kind` pipeline (`"web"` or `"ws"`).
    pub fn insert(
        &mut self,
        kind: &str,
        pass_name: &str,
        pass: Pass,
        position: Position,
    ) -> Result<(), ProxyError> {
        match (kind, pass.step) {
            ("web", Step::Web(step)) => splice(&mut self.web, pass_name, Named { name: pass.name, pass: step }, position),
            ("ws", Step::Ws(step)) => splice(&mut self.ws, pass_name, Named { name: pass.name, pass: step }, position),
            ("web", Step::Ws(_)) => Err(ProxyError::InvalidPipelineType("web (got a ws pass)".to_string())),
            ("ws", Step::Web(_)) => Err(ProxyError::InvalidPipelineType("ws (got a web pass)".to_string())),
            (other, _) => Err(ProxyError::InvalidPipelineType(other.to_string())),
        }
    }

    /// Pass names of the `kind` pipeline, in order.
    pub fn names(&self, kind: &str) -> Result<Vec<String>, ProxyError> {
        match kind {
            "web" => Ok(self.web.iter().map(|p| p.name.clone()).collect()),
            "ws" => Ok(self.ws.iter().map(|p| p.name.clone()).collect()),
            other => Err(ProxyError::InvalidPipelineType(other.to_string())),
        }
    }

    pub(crate) fn web(&self) -> &[Named<dyn WebPass>] {
        &self.web
    }

    pub(crate) fn ws(&self) -> &[Named<dyn WsPass>] {
        &self.ws
    }
}

fn splice<P: ?Sized>(
    list: &mut Vec<Named<P>>,
    pass_name: &str,
    pass: Named<P>,
    position: Position,
) -> Result<(), ProxyError> {
    let index = list
        .iter()
        .rposition(|named| named.name == pass_name)
        .ok_or_else(|| ProxyError::NoSuchPass(pass_name.to_string()))?;
    let index = match position {
        Position::Before => index,
        Position::After => index + 1,
    };
    list.insert(index, pass);
    Ok(())
}

/// Run `passes` in order until one halts.
pub(crate) async fn run_web(passes: &[Named<dyn WebPass>], ctx: &mut WebContext<'_>) -> Flow {
    for named in passes {
        if named.pass.run(ctx).await == Flow::Halt {
            tracing::debug!(pass = %named.name, "Web pipeline halted");
            return Flow::Halt;
        }
    }
    Flow::Continue
}

/// Run `passes` in order until one halts.
pub(crate) async fn run_ws(passes: &[Named<dyn WsPass>], ctx: &mut WsContext<'_>) -> Flow {
    for named in passes {
        if named.pass.run(ctx).await == Flow::Halt {
            tracing::debug!(pass = %named.name, "Ws pipeline halted");
            return Flow::Halt;
        }
    }
    Flow::Continue
}

/// Port the client addressed: from the `Host` header, else by TLS state.
pub(crate) fn inbound_port(req: &RequestHead) -> String {
    static HOST_PORT: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r":(\d+)").expect("valid regex"));

    req.host()
        .and_then(|host| HOST_PORT.captures(host))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| if req.encrypted { "443" } else { "80" }.to_string())
}

/// Append `x-forwarded-for`, `-port` and `-proto`, comma-joined with any
/// value already present.
pub(crate) fn append_forwarded(req: &mut RequestHead, proto: &str) {
    let remote = req
        .remote_addr
        .as_ref()
        .map(SocketAddr::ip)
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    let port = inbound_port(req);

    for (name, value) in [
        ("x-forwarded-for", remote.as_str()),
        ("x-forwarded-port", port.as_str()),
        ("x-forwarded-proto", proto),
    ] {
        append_header(&mut req.headers, HeaderName::from_static(name), value);
    }
}

fn append_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    let joined = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{},{}", prior, value),
        _ => value.to_string(),
    };
    match HeaderValue::from_str(&joined) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::debug!(header = %name, "Skipping unrepresentable forwarded header"),
    }
}
