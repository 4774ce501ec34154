//! Default passes of the web pipeline.
//!
//! # Data Flow
//! ```text
//! delete_length → timeout → x_headers → stream
//!                                         ├─ forward (spawned, response ignored)
//!                                         └─ target → [redirect hops] → proxyRes
//!                                              → web_outgoing passes → client body
//! ```
//!
//! # Design Decisions
//! - 307/308 replay uses a bounded recording of the request body; a body
//!   that did not fit, or was not fully sent yet, stops redirect following
//!   and the redirect is relayed as-is
//! - The inbound idle timeout covers both the wait for upstream headers and
//!   the relayed body (`TimeoutBody`)
//! - `end` fires at most once, when the relayed body finishes or right away
//!   if a pass already finished the response

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hyper::body::{Body, Incoming};
use hyper::header::{
    HeaderValue, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, EXPECT, HOST, LOCATION,
    TRANSFER_ENCODING, UPGRADE,
};
use hyper::{Method, Request, Response, StatusCode};
use tower_http::timeout::TimeoutBody;
use tracing::Instrument;
use url::Url;

use super::{append_forwarded, web_outgoing, Flow, Named, WebContext, WebPass};
use crate::config::schema::{ProxyOptions, Target, TlsMaterial};
use crate::error::ProxyError;
use crate::http::body::{self, EndNotify, ProxyBody, RecordingBody, ReplayHandle};
use crate::http::outgoing::{apply_header_overrides, setup_outgoing, OutgoingRequest, TargetSlot};
use crate::http::request::{InboundSocket, RequestHead};
use crate::http::server::ProxyServer;
use crate::net::transport;
use crate::observability::events::ProxyEvent;
use crate::observability::metrics;

const REDIRECT_STATUSES: [u16; 5] = [301, 302, 303, 307, 308];

pub(crate) fn default_passes() -> Vec<Named<dyn WebPass>> {
    vec![
        named("delete_length", DeleteLength),
        named("timeout", Timeout),
        named("x_headers", XHeaders),
        named("stream", Stream),
    ]
}

fn named(name: &str, pass: impl WebPass + 'static) -> Named<dyn WebPass> {
    Named {
        name: name.to_string(),
        pass: Arc::new(pass),
    }
}

/// `DELETE`/`OPTIONS` without `content-length` get an explicit `0`.
pub struct DeleteLength;

#[async_trait]
impl WebPass for DeleteLength {
    async fn run(&self, ctx: &mut WebContext<'_>) -> Flow {
        let head = &mut ctx.req.head;
        if (head.method == Method::DELETE || head.method == Method::OPTIONS)
            && !head.headers.contains_key(CONTENT_LENGTH)
        {
            head.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            head.headers.remove(TRANSFER_ENCODING);
        }
        Flow::Continue
    }
}

/// Arms the inbound idle timeout.
pub struct Timeout;

#[async_trait]
impl WebPass for Timeout {
    async fn run(&self, ctx: &mut WebContext<'_>) -> Flow {
        if let Some(limit) = ctx.options.inbound_timeout() {
            ctx.req.socket_mut().set_timeout(limit);
        }
        Flow::Continue
    }
}

/// Appends `x-forwarded-*` headers when `xfwd` is on.
pub struct XHeaders;

#[async_trait]
impl WebPass for XHeaders {
    async fn run(&self, ctx: &mut WebContext<'_>) -> Flow {
        if !ctx.options.xfwd_enabled() {
            return Flow::Continue;
        }
        let head = &mut ctx.req.head;
        let proto = if head.encrypted { "https" } else { "http" };
        append_forwarded(head, proto);

        if !head.headers.contains_key("x-forwarded-host") {
            let host = head.host().unwrap_or("").to_string();
            if let Ok(value) = HeaderValue::from_str(&host) {
                head.headers.insert("x-forwarded-host", value);
            }
        }
        Flow::Continue
    }
}

/// Sends the request upstream and relays the response.
pub struct Stream;

#[async_trait]
impl WebPass for Stream {
    async fn run(&self, ctx: &mut WebContext<'_>) -> Flow {
        let options = ctx.options;
        let server = ctx.server;
        metrics::record_flow_started("web");

        if let Some(target) = options.target.as_ref().or(options.forward.as_ref()) {
            server.emit(&mut ProxyEvent::Start {
                req: &ctx.req.head,
                target,
            });
        }

        let body = match options.buffer.clone() {
            Some(buffer) => body::full(buffer),
            None => ctx.req.take_body(),
        };

        let body = if options.forward.is_some() {
            let (forward_body, rest) = if options.target.is_some() {
                let (forward_body, rest) = body::tee(body);
                (forward_body, Some(rest))
            } else {
                (body, None)
            };
            spawn_forward(ctx, forward_body);
            match rest {
                Some(rest) => rest,
                None => {
                    ctx.res.end();
                    return Flow::Halt;
                }
            }
        } else {
            body
        };

        proxy_to_target(ctx, body).await;
        Flow::Continue
    }
}

/// Fire-and-forget copy of the request to `forward`.
fn spawn_forward(ctx: &mut WebContext<'_>, body: ProxyBody) {
    let target = ctx.options.forward.clone();
    let desc = match setup_outgoing(ctx.options, &ctx.req.head, TargetSlot::Forward) {
        Ok(desc) => desc,
        Err(e) => {
            ctx.errors.report(e, &ctx.req.head, None, target.as_ref());
            return;
        }
    };

    let errors = ctx.errors.clone();
    let head = ctx.req.head.clone();
    let inbound = ctx.req.socket().clone();
    tokio::spawn(
        async move {
            let result = async {
                let request = desc.to_request(body)?;
                let response = transport::send(&desc, request).await?;
                tracing::debug!(endpoint = %desc.endpoint(), status = %response.status(), "Forward answered");
                Ok::<_, ProxyError>(())
            }
            .await;
            if let Err(e) = result {
                errors.report_upstream(e, &head, inbound.is_destroyed(), None, target.as_ref());
            }
        }
        .instrument(tracing::Span::current()),
    );
}

async fn proxy_to_target(ctx: &mut WebContext<'_>, body: ProxyBody) {
    let options = ctx.options;
    let errors = ctx.errors;
    let inbound = ctx.req.socket().clone();
    let started = Instant::now();

    let Some(mut current_target) = options.target.clone() else {
        return;
    };
    let desc = match setup_outgoing(options, &ctx.req.head, TargetSlot::Target) {
        Ok(desc) => desc,
        Err(e) => {
            errors.report(e, &ctx.req.head, Some(&mut *ctx.res), Some(&current_target));
            return;
        }
    };

    let max_redirects = options.max_redirects();
    let (body, replay) = if max_redirects > 0 {
        let (recording, handle) = RecordingBody::new(body, options.redirect_body_limit());
        (body::boxed(recording), Some(handle))
    } else {
        (body, None)
    };

    let first = match desc.to_request(body) {
        Ok(mut request) => {
            expose_request(ctx, &mut request);
            exchange(&desc, request, options.proxy_timeout(), &inbound).await
        }
        Err(e) => Err(e),
    };
    let mut response = match first {
        Ok(response) => response,
        Err(e) => {
            let gone = inbound.is_destroyed();
            errors.report_upstream(e, &ctx.req.head, gone, Some(&mut *ctx.res), Some(&current_target));
            return;
        }
    };

    let mut current_url = current_target.to_url();
    let mut hops = 0;
    while hops < max_redirects {
        let Some(hop) = next_hop(&response, current_url.as_ref(), replay.as_ref()) else {
            break;
        };
        drop(response);

        let next_target = Target::from_url(&hop.location).ok();
        if let Some(target) = next_target {
            current_target = target;
        }
        let request = redirect_request(options, &ctx.req.head, &hop);
        let result = match request {
            Ok((desc, mut request)) => {
                expose_request(ctx, &mut request);
                exchange(&desc, request, options.proxy_timeout(), &inbound).await
            }
            Err(e) => Err(e),
        };
        response = match result {
            Ok(response) => response,
            Err(e) => {
                let gone = inbound.is_destroyed();
                errors.report_upstream(e, &ctx.req.head, gone, Some(&mut *ctx.res), Some(&current_target));
                return;
            }
        };

        metrics::record_redirect_followed(hop.status);
        tracing::debug!(status = hop.status, location = %hop.location, "Followed redirect");
        current_url = Some(hop.location);
        hops += 1;
    }

    metrics::record_upstream_response("web", started);
    tracing::debug!(status = %response.status(), "Upstream responded");
    relay(ctx, response, &inbound);
}

/// Emit `proxyReq` unless the request waits for `100 Continue`.
fn expose_request(ctx: &mut WebContext<'_>, request: &mut Request<ProxyBody>) {
    if request.headers().contains_key(EXPECT) {
        return;
    }
    ctx.server.emit(&mut ProxyEvent::ProxyReq {
        proxy_req: request,
        req: &ctx.req.head,
        res: &*ctx.res,
        options: ctx.options,
    });
}

/// Send `request`, bounded by `proxy_timeout` and the inbound idle timeout.
async fn exchange(
    desc: &OutgoingRequest,
    request: Request<ProxyBody>,
    proxy_timeout: Option<Duration>,
    inbound: &InboundSocket,
) -> Result<Response<Incoming>, ProxyError> {
    let send = async {
        match proxy_timeout {
            Some(limit) => tokio::time::timeout(limit, transport::send(desc, request))
                .await
                .map_err(|_| ProxyError::UpstreamTimeout(limit))?,
            None => transport::send(desc, request).await,
        }
    };
    with_inbound_timeout(inbound, send).await
}

async fn with_inbound_timeout<T>(
    inbound: &InboundSocket,
    fut: impl Future<Output = Result<T, ProxyError>>,
) -> Result<T, ProxyError> {
    let Some(limit) = inbound.timeout() else {
        return fut.await;
    };
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!(timeout = ?limit, "Inbound socket timed out");
            inbound.destroy();
            Err(ProxyError::ConnectionReset(format!("client socket idle for {:?}", limit)))
        }
    }
}

/// A redirect the stream pass is about to follow.
struct Hop {
    status: u16,
    location: Url,
    host_changed: bool,
    /// Body to replay for 307/308, `None` for the method-changing codes.
    replay: Option<bytes::Bytes>,
}

fn next_hop(response: &Response<Incoming>, current: Option<&Url>, replay: Option<&ReplayHandle>) -> Option<Hop> {
    let status = response.status().as_u16();
    if !REDIRECT_STATUSES.contains(&status) {
        return None;
    }
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    let current = current?;
    let location = current.join(location).ok()?;

    let replay = if status == 307 || status == 308 {
        let snapshot = replay?.lock().ok()?.snapshot();
        if snapshot.is_none() {
            tracing::debug!(status, "Request body not replayable, relaying redirect");
        }
        Some(snapshot?)
    } else {
        None
    };

    Some(Hop {
        status,
        host_changed: host_with_port(&location) != host_with_port(current),
        location,
        replay,
    })
}

fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or("");
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn redirect_request(
    options: &ProxyOptions,
    req: &RequestHead,
    hop: &Hop,
) -> Result<(OutgoingRequest, Request<ProxyBody>), ProxyError> {
    let location = &hop.location;
    let mut headers = req.headers.clone();
    if let Some(overrides) = &options.headers {
        apply_header_overrides(&mut headers, overrides)?;
    }

    let host = host_with_port(location);
    headers.insert(
        HOST,
        HeaderValue::from_str(&host).map_err(|_| ProxyError::InvalidHeader(host.clone()))?,
    );
    if hop.host_changed {
        headers.remove(AUTHORIZATION);
        headers.remove(COOKIE);
    }
    if hop.replay.is_none() {
        headers.remove(CONTENT_LENGTH);
        headers.remove(CONTENT_TYPE);
        headers.remove(TRANSFER_ENCODING);
    }
    if options.agent.is_none() && !headers.contains_key(UPGRADE) {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    let protocol = format!("{}:", location.scheme());
    let secure = crate::config::schema::is_ssl(&protocol);
    let tls = TlsMaterial {
        ca: options.ca.clone(),
        ..Default::default()
    };

    let (method, body) = match &hop.replay {
        Some(replay) => (req.method.clone(), body::full(replay.clone())),
        None => (Method::GET, body::empty()),
    };

    let desc = OutgoingRequest {
        protocol,
        host: Some(host),
        hostname: location.host_str().map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string()),
        port: location.port_or_known_default().unwrap_or(80),
        socket_path: None,
        tls,
        method,
        path: location[url::Position::BeforePath..url::Position::AfterQuery].to_string(),
        headers,
        auth: None,
        reject_unauthorized: secure.then(|| options.secure.unwrap_or(true)),
        agent: options.agent.clone(),
        local_address: options.local_address,
        preserve_header_case: options.preserves_header_case(),
    };
    let request = desc.to_request(body)?;
    Ok((desc, request))
}

/// Emits `end` once.
#[derive(Clone)]
struct EndSignal {
    server: ProxyServer,
    req: Arc<RequestHead>,
    status: StatusCode,
    fired: Arc<AtomicBool>,
}

impl EndSignal {
    fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.server.emit(&mut ProxyEvent::End {
                req: &self.req,
                status: self.status,
            });
        }
    }
}

fn relay(ctx: &mut WebContext<'_>, response: Response<Incoming>, inbound: &InboundSocket) {
    let options = ctx.options;
    let (parts, incoming) = response.into_parts();
    let end = EndSignal {
        server: ctx.server.clone(),
        req: Arc::new(ctx.req.head.clone()),
        status: parts.status,
        fired: Arc::new(AtomicBool::new(false)),
    };
    let on_end = end.clone();
    let body = body::boxed(EndNotify::new(body::boxed(incoming), move || on_end.fire()));
    let mut proxy_res = Response::from_parts(parts, body);

    ctx.server.emit(&mut ProxyEvent::ProxyRes {
        proxy_res: &mut proxy_res,
        req: &ctx.req.head,
        res: &mut *ctx.res,
    });

    if !ctx.res.headers_sent() && !options.self_handles_response() {
        web_outgoing::run(&ctx.req.head, &mut *ctx.res, &mut proxy_res, options);
    }

    if ctx.res.is_finished() {
        end.fire();
        return;
    }
    if options.self_handles_response() {
        return;
    }

    let body = proxy_res.into_body();
    if body.is_end_stream() {
        end.fire();
    }
    let body = match inbound.timeout() {
        Some(limit) => body::boxed(TimeoutBody::new(limit, body)),
        None => body,
    };
    ctx.res.send(body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::ProxyRequest;
    use crate::http::response::ServerResponse;
    use crate::http::middleware::FlowErrors;

    fn run_pass<P: WebPass>(pass: P, head: RequestHead, options: ProxyOptions) -> RequestHead {
        let server = ProxyServer::new(ProxyOptions::default());
        let errors = FlowErrors::new(server.clone(), None);
        let mut req = ProxyRequest::from_head(head);
        let mut res = ServerResponse::new();
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let mut ctx = WebContext {
                req: &mut req,
                res: &mut res,
                options: &options,
                server: &server,
                errors: &errors,
            };
            assert_eq!(pass.run(&mut ctx).await, Flow::Continue);
        });
        req.head
    }

    #[test]
    fn test_delete_length() {
        let mut head = RequestHead::new(Method::DELETE, "/".parse().unwrap());
        head.headers.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
        let head = run_pass(DeleteLength, head, ProxyOptions::default());
        assert_eq!(head.headers[CONTENT_LENGTH], "0");
        assert!(!head.headers.contains_key(TRANSFER_ENCODING));

        let mut head = RequestHead::new(Method::OPTIONS, "/".parse().unwrap());
        head.headers.insert(CONTENT_LENGTH, "3".parse().unwrap());
        let head = run_pass(DeleteLength, head, ProxyOptions::default());
        assert_eq!(head.headers[CONTENT_LENGTH], "3");

        let head = run_pass(DeleteLength, RequestHead::new(Method::GET, "/".parse().unwrap()), ProxyOptions::default());
        assert!(!head.headers.contains_key(CONTENT_LENGTH));
    }

    #[test]
    fn test_x_headers() {
        let mut head = RequestHead::new(Method::GET, "/".parse().unwrap());
        head.remote_addr = Some("192.168.1.2:40000".parse().unwrap());
        head.encrypted = true;
        head.headers.insert(HOST, "proxy.example".parse().unwrap());
        let options = ProxyOptions {
            xfwd: Some(true),
            ..Default::default()
        };
        let head = run_pass(XHeaders, head, options);
        assert_eq!(head.headers["x-forwarded-for"], "192.168.1.2");
        assert_eq!(head.headers["x-forwarded-port"], "443");
        assert_eq!(head.headers["x-forwarded-proto"], "https");
        assert_eq!(head.headers["x-forwarded-host"], "proxy.example");
    }

    #[test]
    fn test_x_headers_disabled() {
        let head = run_pass(XHeaders, RequestHead::new(Method::GET, "/".parse().unwrap()), ProxyOptions::default());
        assert!(!head.headers.contains_key("x-forwarded-for"));
    }

    fn hop(status: u16, location: &str, current: &str, replay: Option<&str>) -> Hop {
        let current = Url::parse(current).unwrap();
        let location = current.join(location).unwrap();
        Hop {
            status,
            host_changed: host_with_port(&location) != host_with_port(&current),
            location,
            replay: replay.map(|r| bytes::Bytes::from(r.to_string())),
        }
    }

    fn post_head() -> RequestHead {
        let mut head = RequestHead::new(Method::POST, "/submit".parse().unwrap());
        head.headers.insert(HOST, "a.local:8080".parse().unwrap());
        head.headers.insert(CONTENT_LENGTH, "5".parse().unwrap());
        head.headers.insert(CONTENT_TYPE, "text/plain".parse().unwrap());
        head.headers.insert(AUTHORIZATION, "Bearer t".parse().unwrap());
        head.headers.insert(COOKIE, "sid=1".parse().unwrap());
        head
    }

    #[test]
    fn test_redirect_307_replays_method_and_body() {
        let hop = hop(307, "/next?x=1", "http://a.local:8080/submit", Some("hello"));
        let (desc, request) = redirect_request(&ProxyOptions::default(), &post_head(), &hop).unwrap();
        assert_eq!(desc.method, Method::POST);
        assert_eq!(desc.path, "/next?x=1");
        assert_eq!(desc.port, 8080);
        assert_eq!(request.headers()[HOST], "a.local:8080");
        assert_eq!(request.headers()[CONTENT_LENGTH], "5");
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer t");
        assert_eq!(request.headers()[CONNECTION], "close");
    }

    #[test]
    fn test_redirect_302_becomes_get_without_body_headers() {
        let hop = hop(302, "/done", "http://a.local:8080/submit", None);
        let (desc, request) = redirect_request(&ProxyOptions::default(), &post_head(), &hop).unwrap();
        assert_eq!(desc.method, Method::GET);
        assert!(!request.headers().contains_key(CONTENT_LENGTH));
        assert!(!request.headers().contains_key(CONTENT_TYPE));
        assert!(request.body().is_end_stream());
    }

    #[test]
    fn test_cross_origin_redirect_strips_credentials() {
        let hop = hop(302, "https://b.local/landing", "http://a.local:8080/submit", None);
        assert!(hop.host_changed);
        let (desc, request) = redirect_request(&ProxyOptions::default(), &post_head(), &hop).unwrap();
        assert!(!request.headers().contains_key(AUTHORIZATION));
        assert!(!request.headers().contains_key(COOKIE));
        assert_eq!(request.headers()[HOST], "b.local");
        assert_eq!(desc.port, 443);
        assert_eq!(desc.reject_unauthorized, Some(true));
    }

    #[test]
    fn test_same_origin_redirect_keeps_credentials() {
        let hop = hop(301, "http://a.local:8080/other", "http://a.local:8080/submit", None);
        assert!(!hop.host_changed);
        let (_, request) = redirect_request(&ProxyOptions::default(), &post_head(), &hop).unwrap();
        assert_eq!(request.headers()[COOKIE], "sid=1");
    }

    #[test]
    fn test_redirect_applies_header_overrides() {
        let options = ProxyOptions {
            headers: Some([("x-extra".to_string(), "1".to_string())].into_iter().collect()),
            ..Default::default()
        };
        let hop = hop(303, "/x", "http://a.local/", None);
        let (_, request) = redirect_request(&options, &post_head(), &hop).unwrap();
        assert_eq!(request.headers()["x-extra"], "1");
    }
}
