//! Middleware pipeline behaviour through the full engine: auth verdicts,
//! CORS preflight short-circuits, header rewriting, rate limiting, and
//! response decoration ordering.

mod common;

use common::{Script, ScriptedClient, client_addr, engine_with, get};
use http::{Method, StatusCode, header};
use l8e_harbor::core::route::{MiddlewareSpec, RouteSpec};

fn with_middleware(mut route: RouteSpec, name: &str, config: serde_json::Value) -> RouteSpec {
    route.middleware.push(MiddlewareSpec {
        name: name.to_string(),
        config,
    });
    route
}

#[tokio::test]
async fn test_auth_middleware_gates_the_route() {
    let client = ScriptedClient::new([Script::Status(200)]);
    let engine = engine_with(client.clone());
    let route = with_middleware(
        RouteSpec::new("secure", "/s", "http://b:1"),
        "auth",
        serde_json::json!({"require_role": ["admin"]}),
    );
    engine.install(1, &[route]).await;

    // No credentials: 401, upstream untouched.
    let resp = engine
        .handle_request(get("/s/x"), client_addr(), "http")
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(client.request_count(), 0);

    // With the static token, the request flows through.
    let req = http::Request::builder()
        .uri("/s/x")
        .header(header::AUTHORIZATION, "Bearer secret")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = engine.handle_request(req, client_addr(), "http").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(client.request_count(), 1);
}

#[tokio::test]
async fn test_cors_preflight_short_circuits_before_upstream() {
    let client = ScriptedClient::new([]);
    let engine = engine_with(client.clone());
    let route = with_middleware(
        RouteSpec::new("api", "/api", "http://b:1"),
        "cors",
        serde_json::json!({"allow_origins": ["https://app.example.com"]}),
    );
    engine.install(1, &[route]).await;

    let req = http::Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/x")
        .header(header::ORIGIN, "https://app.example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = engine.handle_request(req, client_addr(), "http").await;

    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        resp.headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "https://app.example.com"
    );
    assert_eq!(client.request_count(), 0);
}

#[tokio::test]
async fn test_header_rewrite_applies_before_forwarding() {
    let client = ScriptedClient::new([Script::Status(200)]);
    let engine = engine_with(client.clone());
    let route = with_middleware(
        RouteSpec::new("api", "/api", "http://b:1"),
        "header-rewrite",
        serde_json::json!({
            "set": {"X-Env": "prod"},
            "remove": ["X-Internal"]
        }),
    );
    engine.install(1, &[route]).await;

    let req = http::Request::builder()
        .uri("/api/x")
        .header("X-Internal", "1")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = engine.handle_request(req, client_addr(), "http").await;
    assert_eq!(resp.status(), StatusCode::OK);

    let recorded = client.recorded();
    assert_eq!(recorded[0].headers.get("x-env").unwrap(), "prod");
    assert!(!recorded[0].headers.contains_key("x-internal"));
}

#[tokio::test]
async fn test_rate_limit_returns_429_after_burst() {
    let client = ScriptedClient::new([Script::Status(200), Script::Status(200)]);
    let engine = engine_with(client.clone());
    let route = with_middleware(
        RouteSpec::new("api", "/api", "http://b:1"),
        "rate-limit",
        serde_json::json!({
            "requests_per_minute": 60,
            "burst_size": 2,
            "key_by": "ip"
        }),
    );
    engine.install(1, &[route]).await;

    for _ in 0..2 {
        let resp = engine
            .handle_request(get("/api/x"), client_addr(), "http")
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let resp = engine
        .handle_request(get("/api/x"), client_addr(), "http")
        .await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(client.request_count(), 2);
}

#[tokio::test]
async fn test_security_headers_decorate_upstream_response() {
    let client = ScriptedClient::new([Script::Status(200)]);
    let engine = engine_with(client.clone());
    let route = with_middleware(
        RouteSpec::new("api", "/api", "http://b:1"),
        "security-headers",
        serde_json::json!({}),
    );
    engine.install(1, &[route]).await;

    let resp = engine
        .handle_request(get("/api/x"), client_addr(), "http")
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
}

#[tokio::test]
async fn test_unknown_middleware_rejected_at_apply() {
    use l8e_harbor::{adapters::MemoryRouteStore, ports::route_store::RouteStore};

    let store = MemoryRouteStore::new();
    let route = with_middleware(
        RouteSpec::new("api", "/api", "http://b:1"),
        "body-rewrite",
        serde_json::json!({}),
    );
    let err = store.apply(vec![route]).await.unwrap_err();
    assert!(err.to_string().contains("unknown middleware"));
}

#[tokio::test]
async fn test_tracing_middleware_propagates_trace_headers_upstream() {
    let client = ScriptedClient::new([Script::Status(200)]);
    let engine = engine_with(client.clone());
    let route = with_middleware(
        RouteSpec::new("api", "/api", "http://b:1"),
        "tracing",
        serde_json::json!({}),
    );
    engine.install(1, &[route]).await;

    let req = http::Request::builder()
        .uri("/api/x")
        .header(
            "traceparent",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        )
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = engine.handle_request(req, client_addr(), "http").await;
    assert_eq!(resp.status(), StatusCode::OK);

    let recorded = client.recorded();
    let traceparent = recorded[0]
        .headers
        .get("traceparent")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    // Same trace id, fresh span id for the upstream hop.
    assert!(traceparent.contains("0af7651916cd43dd8448eb211c80319c"));
    assert!(!traceparent.contains("b7ad6b7169203331"));
}
