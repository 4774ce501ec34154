//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use proxy_relay::{ProxyOptions, ProxyServer};

/// What an upstream saw of a request.
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Seen {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Start an upstream on an ephemeral port that answers with `handler`.
pub async fn start_upstream<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Seen) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    async move {
                        let seen = seen(req).await;
                        Ok::<_, Infallible>(handler(seen).await)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// Start an upstream that echoes what it saw as JSON.
pub async fn start_echo_upstream() -> SocketAddr {
    start_upstream(|seen| async move {
        let headers: serde_json::Map<String, serde_json::Value> = seen
            .headers
            .iter()
            .map(|(n, v)| (n.clone(), serde_json::Value::String(v.clone())))
            .collect();
        let json = serde_json::json!({
            "method": seen.method,
            "url": seen.uri,
            "headers": headers,
            "body": String::from_utf8_lossy(&seen.body),
        });
        Response::builder()
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(json.to_string())))
            .unwrap()
    })
    .await
}

async fn seen(req: Request<Incoming>) -> Seen {
    let (parts, body) = req.into_parts();
    let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
    Seen {
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        headers: parts
            .headers
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect(),
        body,
    }
}

/// A proxy listening on an ephemeral loopback port.
pub async fn start_proxy(options: ProxyOptions) -> (ProxyServer, SocketAddr) {
    let server = ProxyServer::new(options);
    server.listen(0, Some("127.0.0.1")).await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// Options targeting `upstream` with `path` as base path.
pub fn options_for(upstream: SocketAddr, path: &str) -> ProxyOptions {
    ProxyOptions::for_target(&format!("http://{}{}", upstream, path)).unwrap()
}

/// A client that neither pools nor follows redirects.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(0)
        .build()
        .unwrap()
}
