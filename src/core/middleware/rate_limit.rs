//! `rate-limit` middleware built atop `governor`.
//!
//! One keyed limiter per route instance; buckets are created lazily per key
//! (client IP, authenticated subject, or a header value) and synchronized
//! internally by governor's keyed state store.

use std::num::NonZeroU32;

use async_trait::async_trait;
use axum::body::Body;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::keyed::DefaultKeyedStateStore,
};
use http::HeaderName;
use hyper::Request;
use serde::Deserialize;

use crate::{
    core::{
        context::RequestContext,
        middleware::error_response,
        pipeline::{Middleware, PreVerdict},
    },
    metrics,
};

fn default_burst_size() -> u32 {
    1
}

fn default_key_by() -> String {
    "ip".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// `ip`, `user`, or `header:NAME`.
    #[serde(default = "default_key_by")]
    pub key_by: String,
    /// Keys exempt from limiting (IP strings, subjects, header values).
    #[serde(default)]
    pub whitelist: Vec<String>,
}

/// How limiter keys are derived from a request.
#[derive(Debug, Clone)]
pub enum KeyBy {
    Ip,
    User,
    Header(HeaderName),
}

impl KeyBy {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "ip" => Ok(KeyBy::Ip),
            "user" => Ok(KeyBy::User),
            other => match other.strip_prefix("header:") {
                Some(name) => name
                    .parse::<HeaderName>()
                    .map(KeyBy::Header)
                    .map_err(|e| format!("invalid rate-limit header name '{name}': {e}")),
                None => Err(format!(
                    "invalid key_by '{other}': expected 'ip', 'user' or 'header:NAME'"
                )),
            },
        }
    }
}

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

pub struct RateLimitMiddleware {
    limiter: KeyedLimiter,
    key_by: KeyBy,
    whitelist: Vec<String>,
}

impl RateLimitMiddleware {
    pub fn build(config: RateLimitConfig) -> Result<Self, String> {
        let per_minute = NonZeroU32::new(config.requests_per_minute)
            .ok_or_else(|| "requests_per_minute must be greater than 0".to_string())?;
        let burst = NonZeroU32::new(config.burst_size.max(1))
            .ok_or_else(|| "burst_size must be greater than 0".to_string())?;
        let quota = Quota::per_minute(per_minute).allow_burst(burst);
        let key_by = KeyBy::parse(&config.key_by)?;

        Ok(Self {
            limiter: RateLimiter::keyed(quota),
            key_by,
            whitelist: config.whitelist,
        })
    }

    /// Derive the limiter key; `None` means the key source is absent and
    /// the request passes unthrottled.
    fn key_for(&self, ctx: &RequestContext, req: &Request<Body>) -> Option<String> {
        match &self.key_by {
            KeyBy::Ip => ctx.client_ip().map(|ip| ip.to_string()),
            KeyBy::User => ctx.identity.as_ref().map(|id| id.subject.clone()),
            KeyBy::Header(name) => req
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn pre_request(&self, ctx: &mut RequestContext, req: &mut Request<Body>) -> PreVerdict {
        let Some(key) = self.key_for(ctx, req) else {
            return PreVerdict::Continue;
        };
        if self.whitelist.iter().any(|entry| entry == &key) {
            return PreVerdict::Continue;
        }

        if self.limiter.check_key(&key).is_err() {
            metrics::record_rate_limit_event(&ctx.route_id, "limited");
            tracing::debug!(route_id = %ctx.route_id, key = %key, "rate limit exceeded");
            return PreVerdict::ShortCircuit(error_response(
                http::StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                &ctx.request_id,
            ));
        }
        PreVerdict::Continue
    }
}
