//! `logging` middleware: per-route access logging with configurable detail.

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use serde::Deserialize;

use crate::core::{
    context::RequestContext,
    middleware::PathPattern,
    pipeline::{Middleware, PreVerdict},
};

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub include_user_agent: bool,
    #[serde(default)]
    pub include_remote_addr: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
    Warn,
}

impl Level {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw.to_ascii_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            other => Err(format!("invalid logging level '{other}'")),
        }
    }
}

const PATH_KEY: &str = "logging.path";
const METHOD_KEY: &str = "logging.method";
const UA_KEY: &str = "logging.user_agent";

pub struct LoggingMiddleware {
    level: Level,
    exclude: Vec<PathPattern>,
    include_user_agent: bool,
    include_remote_addr: bool,
}

impl LoggingMiddleware {
    pub fn build(config: LoggingConfig) -> Result<Self, String> {
        Ok(Self {
            level: Level::parse(&config.level)?,
            exclude: config
                .exclude_paths
                .iter()
                .map(|p| PathPattern::compile(p))
                .collect::<Result<Vec<_>, _>>()?,
            include_user_agent: config.include_user_agent,
            include_remote_addr: config.include_remote_addr,
        })
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn pre_request(&self, ctx: &mut RequestContext, req: &mut Request<Body>) -> PreVerdict {
        let path = req.uri().path();
        if self.exclude.iter().any(|p| p.matches(path)) {
            return PreVerdict::Continue;
        }
        ctx.values
            .insert(PATH_KEY.into(), serde_json::Value::String(path.to_string()));
        ctx.values.insert(
            METHOD_KEY.into(),
            serde_json::Value::String(req.method().to_string()),
        );
        if self.include_user_agent {
            if let Some(ua) = req
                .headers()
                .get(http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
            {
                ctx.values
                    .insert(UA_KEY.into(), serde_json::Value::String(ua.to_string()));
            }
        }
        PreVerdict::Continue
    }

    async fn post_response(&self, ctx: &mut RequestContext, resp: &mut Response<Body>) {
        let Some(serde_json::Value::String(path)) = ctx.values.get(PATH_KEY) else {
            // Pre pass excluded this path.
            return;
        };
        let method = match ctx.values.get(METHOD_KEY) {
            Some(serde_json::Value::String(m)) => m.as_str(),
            _ => "-",
        };
        let user_agent = match ctx.values.get(UA_KEY) {
            Some(serde_json::Value::String(ua)) => Some(ua.as_str()),
            _ => None,
        };
        let remote = if self.include_remote_addr {
            ctx.client_addr.map(|a| a.to_string())
        } else {
            None
        };
        let status = resp.status().as_u16();
        let duration_ms = ctx.started_at.elapsed().as_millis() as u64;

        match self.level {
            Level::Debug => tracing::debug!(
                route_id = %ctx.route_id,
                request_id = %ctx.request_id,
                method,
                path = %path,
                status,
                duration_ms,
                user_agent,
                remote_addr = remote.as_deref(),
                "request"
            ),
            Level::Info => tracing::info!(
                route_id = %ctx.route_id,
                request_id = %ctx.request_id,
                method,
                path = %path,
                status,
                duration_ms,
                user_agent,
                remote_addr = remote.as_deref(),
                "request"
            ),
            Level::Warn => tracing::warn!(
                route_id = %ctx.route_id,
                request_id = %ctx.request_id,
                method,
                path = %path,
                status,
                duration_ms,
                user_agent,
                remote_addr = remote.as_deref(),
                "request"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[test]
    fn test_level_parse() {
        assert!(Level::parse("INFO").is_ok());
        assert!(Level::parse("warning").is_ok());
        assert!(Level::parse("trace").is_err());
    }

    #[tokio::test]
    async fn test_excluded_path_is_not_recorded() {
        let mw = LoggingMiddleware::build(
            serde_json::from_value(serde_json::json!({"exclude_paths": ["/healthz"]})).unwrap(),
        )
        .unwrap();
        let mut ctx = RequestContext::new(
            "r".into(),
            "route".into(),
            None,
            "http",
            Default::default(),
            CancellationToken::new(),
        );
        let mut req = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        mw.pre_request(&mut ctx, &mut req).await;
        assert!(!ctx.values.contains_key(PATH_KEY));
    }
}
