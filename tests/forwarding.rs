//! Forwarding tests against a real HTTP backend: path rewriting, header
//! hygiene and streaming behaviour over actual sockets.

mod common;

use std::{net::SocketAddr, sync::Arc};

use axum::{Router, body::Body, extract::Request, response::Response};
use common::client_addr;
use http::StatusCode;
use l8e_harbor::{
    adapters::{HttpClientAdapter, StaticTokenAuth},
    core::{middleware::MiddlewareDeps, route::RouteSpec},
    engine::{EngineSettings, ProxyEngine},
};
use tokio_util::sync::CancellationToken;

/// Spawn an echo backend that reports the request it observed via response
/// headers and returns "ok".
async fn spawn_echo() -> SocketAddr {
    let app = Router::new().fallback(|req: Request| async move {
        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header("x-echo-path", req.uri().path())
            .header("x-echo-method", req.method().as_str());
        if let Some(query) = req.uri().query() {
            builder = builder.header("x-echo-query", query);
        }
        for name in ["x-forwarded-for", "x-forwarded-proto", "x-request-id", "connection"] {
            if let Some(value) = req.headers().get(name) {
                builder = builder.header(format!("x-echo-{name}"), value);
            }
        }
        builder.body(Body::from("ok")).unwrap()
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn real_engine() -> Arc<ProxyEngine> {
    Arc::new(ProxyEngine::new(
        Arc::new(HttpClientAdapter::new().unwrap()),
        MiddlewareDeps {
            auth: Arc::new(StaticTokenAuth::new(Default::default())),
        },
        EngineSettings::default(),
        CancellationToken::new(),
    ))
}

fn get(path: &str) -> Request {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn header(resp: &Response, name: &str) -> String {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn test_basic_forward_preserves_path() {
    let backend = spawn_echo().await;
    let engine = real_engine();
    engine
        .install(
            1,
            &[RouteSpec::new("echo", "/e", format!("http://{backend}"))],
        )
        .await;

    let resp = engine
        .handle_request(get("/e/x"), client_addr(), "http")
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "x-echo-path").await, "/e/x");
    assert_eq!(common::body_string(resp).await, "ok");
}

#[tokio::test]
async fn test_strip_prefix_rewrites_upstream_path() {
    let backend = spawn_echo().await;
    let engine = real_engine();
    let mut route = RouteSpec::new("echo", "/e", format!("http://{backend}"));
    route.strip_prefix = true;
    engine.install(1, &[route]).await;

    let resp = engine
        .handle_request(get("/e/x"), client_addr(), "http")
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "x-echo-path").await, "/x");
}

#[tokio::test]
async fn test_add_prefix_after_strip() {
    let backend = spawn_echo().await;
    let engine = real_engine();
    let mut route = RouteSpec::new("echo", "/e", format!("http://{backend}"));
    route.strip_prefix = true;
    route.add_prefix = Some("/v2".into());
    engine.install(1, &[route]).await;

    let resp = engine
        .handle_request(get("/e/x?q=1"), client_addr(), "http")
        .await;
    assert_eq!(header(&resp, "x-echo-path").await, "/v2/x");
    assert_eq!(header(&resp, "x-echo-query").await, "q=1");
}

#[tokio::test]
async fn test_forwarding_headers_reach_upstream() {
    let backend = spawn_echo().await;
    let engine = real_engine();
    engine
        .install(
            1,
            &[RouteSpec::new("echo", "/e", format!("http://{backend}"))],
        )
        .await;

    let resp = engine
        .handle_request(get("/e/x"), client_addr(), "http")
        .await;
    assert_eq!(header(&resp, "x-echo-x-forwarded-for").await, "203.0.113.10");
    assert_eq!(header(&resp, "x-echo-x-forwarded-proto").await, "http");
    assert!(!header(&resp, "x-echo-x-request-id").await.is_empty());
    // Hop-by-hop Connection header must not be forwarded by the gateway.
    assert!(header(&resp, "x-echo-connection").await.is_empty());
}

#[tokio::test]
async fn test_request_body_streams_to_upstream() {
    let backend = spawn_echo().await;

    // A dedicated backend that echoes the body length.
    let app = Router::new().fallback(|req: Request| async move {
        let bytes = axum::body::to_bytes(req.into_body(), 1 << 20).await.unwrap();
        Response::builder()
            .status(StatusCode::OK)
            .header("x-body-len", bytes.len().to_string())
            .body(Body::empty())
            .unwrap()
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let body_backend = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let engine = real_engine();
    engine
        .install(
            1,
            &[
                RouteSpec::new("echo", "/e", format!("http://{backend}")),
                RouteSpec::new("body", "/b", format!("http://{body_backend}")),
            ],
        )
        .await;

    let payload = vec![b'x'; 64 * 1024];
    let req = Request::builder()
        .method(http::Method::POST)
        .uri("/b/upload")
        .body(Body::from(payload.clone()))
        .unwrap();
    let resp = engine.handle_request(req, client_addr(), "http").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        header(&resp, "x-body-len").await,
        payload.len().to_string()
    );
}

#[tokio::test]
async fn test_connection_error_maps_to_502() {
    let engine = real_engine();
    // Nothing listens on this port.
    engine
        .install(1, &[RouteSpec::new("dead", "/d", "http://127.0.0.1:1")])
        .await;

    let resp = engine
        .handle_request(get("/d/x"), client_addr(), "http")
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body = common::body_string(resp).await;
    assert!(body.contains("connection_error") || body.contains("reset"));
}
