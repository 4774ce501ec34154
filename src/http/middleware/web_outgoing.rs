//! Response-side passes: upstream response → client response.
//!
//! Run in fixed order for every response that is not self-handled:
//! `remove_chunked → set_connection → set_redirect_host_rewrite →
//! write_headers → write_status_code`.

use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, LOCATION, SET_COOKIE, TRANSFER_ENCODING};
use hyper::{Response, Version};
use url::{Position, Url};

use super::Flow;
use crate::config::schema::ProxyOptions;
use crate::http::body::ProxyBody;
use crate::http::cookies::rewrite_cookie_property;
use crate::http::request::RequestHead;
use crate::http::response::ServerResponse;

type OutgoingPass = fn(&RequestHead, &mut ServerResponse, &mut Response<ProxyBody>, &ProxyOptions) -> Flow;

const PASSES: [(&str, OutgoingPass); 5] = [
    ("remove_chunked", remove_chunked),
    ("set_connection", set_connection),
    ("set_redirect_host_rewrite", set_redirect_host_rewrite),
    ("write_headers", write_headers),
    ("write_status_code", write_status_code),
];

/// Statuses whose `Location` may be rewritten.
const REWRITABLE_STATUSES: [u16; 5] = [201, 301, 302, 307, 308];

/// Headers HTTP/2 forbids on the wire.
const CONNECTION_SPECIFIC: [&str; 5] = ["connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"];

pub(crate) fn run(req: &RequestHead, res: &mut ServerResponse, proxy_res: &mut Response<ProxyBody>, options: &ProxyOptions) {
    for (name, pass) in PASSES {
        if pass(req, res, proxy_res, options) == Flow::Halt {
            tracing::debug!(pass = name, "Outgoing passes halted");
            break;
        }
    }
}

/// HTTP/1.0 clients cannot take chunked framing.
fn remove_chunked(req: &RequestHead, _: &mut ServerResponse, proxy_res: &mut Response<ProxyBody>, _: &ProxyOptions) -> Flow {
    if req.version == Version::HTTP_10 {
        proxy_res.headers_mut().remove(TRANSFER_ENCODING);
    }
    Flow::Continue
}

fn set_connection(req: &RequestHead, _: &mut ServerResponse, proxy_res: &mut Response<ProxyBody>, _: &ProxyOptions) -> Flow {
    let inbound = req.headers.get(CONNECTION).cloned();
    match req.version {
        Version::HTTP_10 => {
            let value = inbound.unwrap_or_else(|| HeaderValue::from_static("close"));
            proxy_res.headers_mut().insert(CONNECTION, value);
        }
        Version::HTTP_2 => {}
        _ => {
            if !proxy_res.headers().contains_key(CONNECTION) {
                let value = inbound.unwrap_or_else(|| HeaderValue::from_static("keep-alive"));
                proxy_res.headers_mut().insert(CONNECTION, value);
            }
        }
    }
    Flow::Continue
}

/// Rewrite host and/or scheme of a same-origin redirect `Location`.
fn set_redirect_host_rewrite(
    req: &RequestHead,
    _: &mut ServerResponse,
    proxy_res: &mut Response<ProxyBody>,
    options: &ProxyOptions,
) -> Flow {
    let auto_rewrite = options.auto_rewrite.unwrap_or(false);
    if options.host_rewrite.is_none() && !auto_rewrite && options.protocol_rewrite.is_none() {
        return Flow::Continue;
    }
    if !REWRITABLE_STATUSES.contains(&proxy_res.status().as_u16()) {
        return Flow::Continue;
    }
    let Some(location) = proxy_res.headers().get(LOCATION).and_then(|v| v.to_str().ok()) else {
        return Flow::Continue;
    };
    let Ok(location) = Url::parse(location) else {
        return Flow::Continue;
    };
    let Some(target) = options.target.as_ref().and_then(|t| t.to_url()) else {
        return Flow::Continue;
    };
    if authority(&target) != authority(&location) {
        return Flow::Continue;
    }

    let host = match (&options.host_rewrite, auto_rewrite) {
        (Some(host), _) => host.clone(),
        (None, true) => req.host().map(str::to_string).unwrap_or_else(|| authority(&location)),
        (None, false) => authority(&location),
    };
    let scheme = options
        .protocol_rewrite
        .as_deref()
        .map(|p| p.trim_end_matches(':'))
        .unwrap_or_else(|| location.scheme());

    let rewritten = format!("{}://{}{}", scheme, host, &location[Position::BeforePath..]);
    match Url::parse(&rewritten).ok().and_then(|u| HeaderValue::from_str(u.as_str()).ok()) {
        Some(value) => {
            proxy_res.headers_mut().insert(LOCATION, value);
        }
        None => tracing::debug!(location = %rewritten, "Skipping unparsable Location rewrite"),
    }
    Flow::Continue
}

fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or("");
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Copy every upstream header, rewriting `Set-Cookie` attributes.
fn write_headers(
    req: &RequestHead,
    res: &mut ServerResponse,
    proxy_res: &mut Response<ProxyBody>,
    options: &ProxyOptions,
) -> Flow {
    let http2_client = req.version == Version::HTTP_2;
    let domain_rule = options.cookie_domain_rule();
    let path_rule = options.cookie_path_rule();

    let names: Vec<HeaderName> = proxy_res.headers().keys().cloned().collect();
    for name in names {
        if http2_client && CONNECTION_SPECIFIC.contains(&name.as_str()) {
            continue;
        }
        res.headers_mut().remove(&name);
        for value in proxy_res.headers().get_all(&name) {
            let value = if name == SET_COOKIE && (domain_rule.is_some() || path_rule.is_some()) {
                rewrite_set_cookie(value, domain_rule, path_rule)
            } else {
                value.clone()
            };
            res.headers_mut().append(name.clone(), value);
        }
    }

    if options.preserves_header_case() {
        res.extensions_mut().extend(proxy_res.extensions().clone());
    }
    Flow::Continue
}

fn rewrite_set_cookie(
    value: &HeaderValue,
    domain_rule: Option<&crate::config::schema::CookieRewrite>,
    path_rule: Option<&crate::config::schema::CookieRewrite>,
) -> HeaderValue {
    let Ok(cookie) = value.to_str() else {
        return value.clone();
    };
    let mut cookie = cookie.to_string();
    if let Some(rule) = domain_rule {
        cookie = rewrite_cookie_property(&cookie, rule, "domain");
    }
    if let Some(rule) = path_rule {
        cookie = rewrite_cookie_property(&cookie, rule, "path");
    }
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| value.clone())
}

fn write_status_code(_: &RequestHead, res: &mut ServerResponse, proxy_res: &mut Response<ProxyBody>, _: &ProxyOptions) -> Flow {
    res.set_status(proxy_res.status());
    if let Some(reason) = proxy_res.extensions().get::<ReasonPhrase>() {
        res.set_reason(String::from_utf8_lossy(reason.as_bytes()).into_owned());
    }
    Flow::Continue
}
