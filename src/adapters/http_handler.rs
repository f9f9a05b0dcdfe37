//! Ingress request handler.
//!
//! Serves the gateway's own health endpoints, then hands everything else to
//! the proxy engine. Internal faults are caught at this boundary and
//! returned as a bare 500 with the request id; no internal detail leaks.

use std::{net::SocketAddr, sync::Arc};

use axum::body::Body;
use futures_util::FutureExt;
use http::{StatusCode, header};
use hyper::{Request, Response};

use crate::engine::ProxyEngine;

pub struct HttpHandler {
    engine: Arc<ProxyEngine>,
    scheme: &'static str,
}

impl HttpHandler {
    pub fn new(engine: Arc<ProxyEngine>, tls_enabled: bool) -> Self {
        Self {
            engine,
            scheme: if tls_enabled { "https" } else { "http" },
        }
    }

    pub async fn handle(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        match req.uri().path() {
            "/health" => return self.liveness(),
            "/ready" => return self.readiness(),
            "/health/detailed" => return self.detailed_health(),
            _ => {}
        }

        let request_id = req
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default();

        let engine = self.engine.clone();
        let scheme = self.scheme;
        let outcome = std::panic::AssertUnwindSafe(async move {
            engine.handle_request(req, client_addr, scheme).await
        })
        .catch_unwind()
        .await;

        match outcome {
            Ok(response) => response,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(request_id = %request_id, panic = %detail, "request handler panicked");
                crate::core::middleware::error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    &request_id,
                )
            }
        }
    }

    /// Liveness: the process is running.
    fn liveness(&self) -> Response<Body> {
        json_response(StatusCode::OK, serde_json::json!({"status": "alive"}))
    }

    /// Readiness: the route store has produced at least one snapshot.
    fn readiness(&self) -> Response<Body> {
        if self.engine.is_ready() {
            json_response(StatusCode::OK, serde_json::json!({"status": "ready"}))
        } else {
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({"status": "not_ready"}),
            )
        }
    }

    fn detailed_health(&self) -> Response<Body> {
        let snapshot = self.engine.snapshot();
        let backends: Vec<serde_json::Value> = self
            .engine
            .health_registry()
            .summary()
            .into_iter()
            .map(|(url, state)| {
                serde_json::json!({
                    "url": url,
                    "state": state.to_string(),
                })
            })
            .collect();
        let (up, down, unknown) = self.engine.health_registry().counts();
        let degraded = down > 0;

        let body = serde_json::json!({
            "status": if degraded { "degraded" } else { "ok" },
            "snapshot_version": snapshot.version,
            "routes_total": snapshot.route_count(),
            "backends": {
                "up": up,
                "down": down,
                "unknown": unknown,
                "detail": backends,
            },
            "adapters": {
                "route_store": "ok",
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        json_response(StatusCode::OK, body)
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        adapters::auth::DenyAllAuth,
        core::middleware::MiddlewareDeps,
        engine::EngineSettings,
        ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    };

    struct NoopClient;

    #[async_trait::async_trait]
    impl HttpClient for NoopClient {
        async fn send_request(
            &self,
            _req: Request<Body>,
        ) -> HttpClientResult<Response<Body>> {
            Err(HttpClientError::Connect("unused".into()))
        }

        async fn probe(
            &self,
            _req: Request<Body>,
            _timeout: std::time::Duration,
        ) -> HttpClientResult<http::StatusCode> {
            Err(HttpClientError::Connect("unused".into()))
        }
    }

    fn handler() -> HttpHandler {
        let engine = Arc::new(ProxyEngine::new(
            Arc::new(NoopClient),
            MiddlewareDeps {
                auth: Arc::new(DenyAllAuth),
            },
            EngineSettings::default(),
            CancellationToken::new(),
        ));
        HttpHandler::new(engine, false)
    }

    fn req(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_liveness_always_ok() {
        let response = handler().handle(req("/health"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_requires_snapshot() {
        let h = handler();
        let response = h.handle(req("/ready"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        h.engine.install(1, &[]).await;
        let response = h.handle(req("/ready"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unrouted_request_is_404() {
        let h = handler();
        h.engine.install(1, &[]).await;
        let response = h.handle(req("/nothing"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_detailed_health_shape() {
        let h = handler();
        h.engine.install(1, &[]).await;
        let response = h.handle(req("/health/detailed"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["snapshot_version"], 1);
        assert!(value["backends"].is_object());
    }
}
