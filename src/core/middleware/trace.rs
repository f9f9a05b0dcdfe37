//! `tracing` middleware: trace-context extraction and span creation.
//!
//! Accepts W3C `traceparent` or the `X-Trace-Id` / `X-Span-Id` pair; either
//! way a fresh span id is minted for the upstream hop. The forwarder reads
//! the resulting [`TraceContext`] off the request context when building the
//! outbound request.

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use serde::Deserialize;
use uuid::Uuid;

use crate::core::{
    context::{RequestContext, TraceContext},
    pipeline::{Middleware, PreVerdict},
};

fn default_create_spans() -> bool {
    true
}

fn default_span_name_template() -> String {
    "{method} {path}".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TracingConfig {
    #[serde(default = "default_create_spans")]
    pub create_spans: bool,
    #[serde(default = "default_span_name_template")]
    pub span_name_template: String,
    #[serde(default)]
    pub span_attributes: BTreeMap<String, String>,
}

pub struct TracingMiddleware {
    config: TracingConfig,
}

impl TracingMiddleware {
    pub fn new(config: TracingConfig) -> Self {
        Self { config }
    }

    fn span_name(&self, method: &str, path: &str) -> String {
        self.config
            .span_name_template
            .replace("{method}", method)
            .replace("{path}", path)
    }
}

fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn new_span_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

/// Pull trace/parent ids out of the inbound headers, if any.
fn extract_trace(headers: &http::HeaderMap) -> (Option<String>, Option<String>) {
    if let Some(traceparent) = headers.get("traceparent").and_then(|v| v.to_str().ok()) {
        // version-traceid-spanid-flags
        let mut parts = traceparent.split('-');
        let _version = parts.next();
        let trace_id = parts.next().map(str::to_string);
        if trace_id.is_some() {
            return (trace_id, Some(traceparent.to_string()));
        }
    }
    let trace_id = headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (trace_id, None)
}

#[async_trait]
impl Middleware for TracingMiddleware {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn pre_request(&self, ctx: &mut RequestContext, req: &mut Request<Body>) -> PreVerdict {
        let (inbound_trace_id, traceparent) = extract_trace(req.headers());
        let trace_id = inbound_trace_id.unwrap_or_else(new_trace_id);
        let span_id = new_span_id();

        if self.config.create_spans {
            let name = self.span_name(req.method().as_str(), req.uri().path());
            tracing::debug!(
                trace_id = %trace_id,
                span_id = %span_id,
                span_name = %name,
                attributes = ?self.config.span_attributes,
                "span started"
            );
        }

        ctx.trace = Some(TraceContext {
            trace_id,
            span_id,
            traceparent,
        });
        PreVerdict::Continue
    }

    async fn post_response(&self, ctx: &mut RequestContext, resp: &mut Response<Body>) {
        if !self.config.create_spans {
            return;
        }
        if let Some(trace) = &ctx.trace {
            tracing::debug!(
                trace_id = %trace.trace_id,
                span_id = %trace.span_id,
                status = resp.status().as_u16(),
                duration_ms = ctx.started_at.elapsed().as_millis() as u64,
                "span finished"
            );
        }
    }
}
