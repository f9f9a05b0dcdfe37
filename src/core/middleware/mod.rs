//! Middleware registry: name -> (config schema, build).
//!
//! Route specs reference middleware by name with free-form JSON config.
//! [`validate_spec`] is called at route-set apply time so malformed configs
//! and unknown names reject the whole set before anything is published;
//! [`build`] constructs the live instances when a snapshot is compiled.

pub mod auth;
pub mod cors;
pub mod header_rewrite;
pub mod logging;
pub mod rate_limit;
pub mod security_headers;
pub mod trace;

use std::sync::Arc;

use axum::body::Body;
use hyper::Response;
use regex::Regex;

use crate::{
    core::{pipeline::Middleware, route::MiddlewareSpec},
    ports::auth::AuthAdapter,
};

pub use auth::{AuthConfig, AuthMiddleware};
pub use cors::{CorsConfig, CorsMiddleware};
pub use header_rewrite::{HeaderRewriteConfig, HeaderRewriteMiddleware};
pub use logging::{LoggingConfig, LoggingMiddleware};
pub use rate_limit::{RateLimitConfig, RateLimitMiddleware};
pub use security_headers::{SecurityHeadersConfig, SecurityHeadersMiddleware};
pub use trace::{TracingConfig, TracingMiddleware};

/// Recognized middleware names, in registry order.
pub const KNOWN_MIDDLEWARE: &[&str] = &[
    "auth",
    "cors",
    "header-rewrite",
    "rate-limit",
    "logging",
    "tracing",
    "security-headers",
];

/// Shared collaborators handed to middleware constructors.
#[derive(Clone)]
pub struct MiddlewareDeps {
    pub auth: Arc<dyn AuthAdapter>,
}

/// Check that `spec` names a known middleware and its config deserializes
/// and compiles. Does not construct an instance.
pub fn validate_spec(spec: &MiddlewareSpec) -> Result<(), String> {
    let config = &spec.config;
    let detail = |e: String| format!("middleware '{}': {e}", spec.name);
    match spec.name.as_str() {
        "auth" => {
            let cfg: AuthConfig =
                serde_json::from_value(config.clone()).map_err(|e| detail(e.to_string()))?;
            // Compile patterns now so bad ones reject the set, not a request.
            for pattern in cfg
                .allow_anonymous_paths
                .iter()
                .chain(cfg.path_roles.keys())
            {
                PathPattern::compile(pattern).map_err(detail)?;
            }
            Ok(())
        }
        "cors" => serde_json::from_value::<CorsConfig>(config.clone())
            .map(|_| ())
            .map_err(|e| detail(e.to_string())),
        "header-rewrite" => {
            let cfg: HeaderRewriteConfig =
                serde_json::from_value(config.clone()).map_err(|e| detail(e.to_string()))?;
            HeaderRewriteMiddleware::build(cfg).map(|_| ()).map_err(detail)
        }
        "rate-limit" => {
            let cfg: RateLimitConfig =
                serde_json::from_value(config.clone()).map_err(|e| detail(e.to_string()))?;
            rate_limit::KeyBy::parse(&cfg.key_by).map_err(detail)?;
            if cfg.requests_per_minute == 0 {
                return Err(detail("requests_per_minute must be greater than 0".into()));
            }
            Ok(())
        }
        "logging" => {
            let cfg: LoggingConfig =
                serde_json::from_value(config.clone()).map_err(|e| detail(e.to_string()))?;
            LoggingMiddleware::build(cfg).map(|_| ()).map_err(detail)
        }
        "tracing" => serde_json::from_value::<TracingConfig>(config.clone())
            .map(|_| ())
            .map_err(|e| detail(e.to_string())),
        "security-headers" => {
            let cfg: SecurityHeadersConfig =
                serde_json::from_value(config.clone()).map_err(|e| detail(e.to_string()))?;
            SecurityHeadersMiddleware::build(cfg).map(|_| ()).map_err(detail)
        }
        other => Err(format!("unknown middleware '{other}'")),
    }
}

/// Construct a live middleware instance. Specs are expected to have passed
/// [`validate_spec`] already; errors here still propagate rather than panic.
pub fn build(
    spec: &MiddlewareSpec,
    deps: &MiddlewareDeps,
) -> Result<Arc<dyn Middleware>, String> {
    let config = &spec.config;
    let detail = |e: String| format!("middleware '{}': {e}", spec.name);
    let mw: Arc<dyn Middleware> = match spec.name.as_str() {
        "auth" => {
            let cfg: AuthConfig =
                serde_json::from_value(config.clone()).map_err(|e| detail(e.to_string()))?;
            Arc::new(AuthMiddleware::build(cfg, deps.auth.clone()).map_err(detail)?)
        }
        "cors" => {
            let cfg: CorsConfig =
                serde_json::from_value(config.clone()).map_err(|e| detail(e.to_string()))?;
            Arc::new(CorsMiddleware::new(cfg))
        }
        "header-rewrite" => {
            let cfg: HeaderRewriteConfig =
                serde_json::from_value(config.clone()).map_err(|e| detail(e.to_string()))?;
            Arc::new(HeaderRewriteMiddleware::build(cfg).map_err(detail)?)
        }
        "rate-limit" => {
            let cfg: RateLimitConfig =
                serde_json::from_value(config.clone()).map_err(|e| detail(e.to_string()))?;
            Arc::new(RateLimitMiddleware::build(cfg).map_err(detail)?)
        }
        "logging" => {
            let cfg: LoggingConfig =
                serde_json::from_value(config.clone()).map_err(|e| detail(e.to_string()))?;
            Arc::new(LoggingMiddleware::build(cfg).map_err(detail)?)
        }
        "tracing" => {
            let cfg: TracingConfig =
                serde_json::from_value(config.clone()).map_err(|e| detail(e.to_string()))?;
            Arc::new(TracingMiddleware::new(cfg))
        }
        "security-headers" => {
            let cfg: SecurityHeadersConfig =
                serde_json::from_value(config.clone()).map_err(|e| detail(e.to_string()))?;
            Arc::new(SecurityHeadersMiddleware::build(cfg).map_err(detail)?)
        }
        other => return Err(format!("unknown middleware '{other}'")),
    };
    Ok(mw)
}

/// Path pattern used by middleware config (anonymous paths, role maps,
/// logging exclusions). `~`-prefixed patterns are regexes, a trailing `*`
/// makes a prefix, anything else matches exactly.
#[derive(Debug, Clone)]
pub enum PathPattern {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl PathPattern {
    pub fn compile(pattern: &str) -> Result<Self, String> {
        if let Some(expr) = pattern.strip_prefix('~') {
            Regex::new(expr)
                .map(PathPattern::Regex)
                .map_err(|e| format!("invalid path pattern '{pattern}': {e}"))
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            Ok(PathPattern::Prefix(prefix.to_string()))
        } else {
            Ok(PathPattern::Exact(pattern.to_string()))
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(p) => path == p,
            PathPattern::Prefix(p) => path.starts_with(p),
            PathPattern::Regex(r) => r.is_match(path),
        }
    }
}

/// Small JSON error body shared by short-circuiting middlewares; matches
/// the gateway's top-level error shape (`{error, request_id}`).
pub fn error_response(
    status: http::StatusCode,
    error: &str,
    request_id: &str,
) -> Response<Body> {
    let body = serde_json::json!({ "error": error, "request_id": request_id });
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
