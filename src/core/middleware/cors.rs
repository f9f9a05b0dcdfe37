//! `cors` middleware: answers preflight requests directly and decorates
//! responses with the configured CORS headers.

use async_trait::async_trait;
use axum::body::Body;
use http::{HeaderValue, Method, StatusCode, header};
use hyper::{Request, Response};
use serde::Deserialize;

use crate::core::{
    context::RequestContext,
    pipeline::{Middleware, PreVerdict},
};

fn default_allow_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_allow_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_allow_headers() -> Vec<String> {
    vec!["Content-Type".to_string(), "Authorization".to_string()]
}

fn default_max_age() -> u64 {
    86_400
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsConfig {
    #[serde(default = "default_allow_origins")]
    pub allow_origins: Vec<String>,
    #[serde(default = "default_allow_methods")]
    pub allow_methods: Vec<String>,
    #[serde(default = "default_allow_headers")]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default = "default_max_age")]
    pub max_age: u64,
}

const ORIGIN_KEY: &str = "cors.origin";

pub struct CorsMiddleware {
    config: CorsConfig,
    allow_methods_value: String,
    allow_headers_value: String,
    expose_headers_value: String,
}

impl CorsMiddleware {
    pub fn new(config: CorsConfig) -> Self {
        let allow_methods_value = config.allow_methods.join(", ");
        let allow_headers_value = config.allow_headers.join(", ");
        let expose_headers_value = config.expose_headers.join(", ");
        Self {
            config,
            allow_methods_value,
            allow_headers_value,
            expose_headers_value,
        }
    }

    /// Resolve the `Access-Control-Allow-Origin` value for a request
    /// origin, or `None` when the origin is not allowed.
    fn allowed_origin(&self, origin: &str) -> Option<String> {
        if self.config.allow_origins.iter().any(|o| o == "*") {
            // Credentialed responses may not use the wildcard form.
            if self.config.allow_credentials {
                return Some(origin.to_string());
            }
            return Some("*".to_string());
        }
        self.config
            .allow_origins
            .iter()
            .find(|o| o.as_str() == origin)
            .cloned()
    }

    fn apply_headers(&self, resp: &mut Response<Body>, origin_value: &str) {
        let headers = resp.headers_mut();
        if let Ok(value) = HeaderValue::from_str(origin_value) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        if self.config.allow_credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        if !self.expose_headers_value.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.expose_headers_value) {
                headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, value);
            }
        }
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    fn name(&self) -> &'static str {
        "cors"
    }

    async fn pre_request(&self, ctx: &mut RequestContext, req: &mut Request<Body>) -> PreVerdict {
        let Some(origin) = req
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            return PreVerdict::Continue;
        };

        let Some(origin_value) = self.allowed_origin(&origin) else {
            // Disallowed origins pass through without CORS decoration; the
            // browser enforces the block.
            return PreVerdict::Continue;
        };

        // Preflight: answer directly, upstream never sees it.
        if req.method() == Method::OPTIONS
            && req
                .headers()
                .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
        {
            let mut resp = Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Body::empty())
                .unwrap_or_else(|_| Response::new(Body::empty()));
            let headers = resp.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&self.allow_methods_value) {
                headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
            }
            if let Ok(value) = HeaderValue::from_str(&self.allow_headers_value) {
                headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
            }
            if let Ok(value) = HeaderValue::from_str(&self.config.max_age.to_string()) {
                headers.insert(header::ACCESS_CONTROL_MAX_AGE, value);
            }
            self.apply_headers(&mut resp, &origin_value);
            return PreVerdict::ShortCircuit(resp);
        }

        ctx.values
            .insert(ORIGIN_KEY.into(), serde_json::Value::String(origin_value));
        PreVerdict::Continue
    }

    async fn post_response(&self, ctx: &mut RequestContext, resp: &mut Response<Body>) {
        if let Some(serde_json::Value::String(origin_value)) = ctx.values.get(ORIGIN_KEY) {
            let origin_value = origin_value.clone();
            self.apply_headers(resp, &origin_value);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new(
            "r".into(),
            "route".into(),
            None,
            "http",
            Default::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_preflight_short_circuits() {
        let mw = CorsMiddleware::new(serde_json::from_value(serde_json::json!({})).unwrap());
        let mut req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api")
            .header(header::ORIGIN, "https://app.example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        match mw.pre_request(&mut ctx(), &mut req).await {
            PreVerdict::ShortCircuit(resp) => {
                assert_eq!(resp.status(), StatusCode::NO_CONTENT);
                assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
                assert_eq!(
                    resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
                    "*"
                );
            }
            _ => panic!("expected preflight response"),
        }
    }

    #[tokio::test]
    async fn test_response_decorated_for_allowed_origin() {
        let mw = CorsMiddleware::new(
            serde_json::from_value(serde_json::json!({
                "allow_origins": ["https://app.example.com"],
                "allow_credentials": true
            }))
            .unwrap(),
        );
        let mut c = ctx();
        let mut req = Request::builder()
            .uri("/api")
            .header(header::ORIGIN, "https://app.example.com")
            .body(Body::empty())
            .unwrap();
        assert!(matches!(
            mw.pre_request(&mut c, &mut req).await,
            PreVerdict::Continue
        ));

        let mut resp = Response::new(Body::empty());
        mw.post_response(&mut c, &mut resp).await;
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://app.example.com"
        );
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
                .unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn test_disallowed_origin_left_undecorated() {
        let mw = CorsMiddleware::new(
            serde_json::from_value(serde_json::json!({
                "allow_origins": ["https://app.example.com"]
            }))
            .unwrap(),
        );
        let mut c = ctx();
        let mut req = Request::builder()
            .uri("/api")
            .header(header::ORIGIN, "https://evil.example.com")
            .body(Body::empty())
            .unwrap();
        assert!(matches!(
            mw.pre_request(&mut c, &mut req).await,
            PreVerdict::Continue
        ));
        let mut resp = Response::new(Body::empty());
        mw.post_response(&mut c, &mut resp).await;
        assert!(!resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }
}
