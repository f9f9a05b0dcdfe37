//! `security-headers` middleware: response hardening headers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::body::Body;
use http::{HeaderName, HeaderValue};
use hyper::Response;
use serde::Deserialize;

use crate::core::{context::RequestContext, pipeline::Middleware};

fn default_headers() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("X-Content-Type-Options".to_string(), "nosniff".to_string()),
        ("X-Frame-Options".to_string(), "DENY".to_string()),
        ("X-XSS-Protection".to_string(), "1; mode=block".to_string()),
        (
            "Referrer-Policy".to_string(),
            "strict-origin-when-cross-origin".to_string(),
        ),
    ])
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityHeadersConfig {
    #[serde(default = "default_headers")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub remove_headers: Vec<String>,
}

pub struct SecurityHeadersMiddleware {
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl SecurityHeadersMiddleware {
    pub fn build(config: SecurityHeadersConfig) -> Result<Self, String> {
        let set = config
            .headers
            .iter()
            .map(|(name, value)| {
                let name = name
                    .parse::<HeaderName>()
                    .map_err(|e| format!("invalid header name '{name}': {e}"))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| format!("invalid header value for '{name}': {e}"))?;
                Ok::<_, String>((name, value))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let remove = config
            .remove_headers
            .iter()
            .map(|name| {
                name.parse::<HeaderName>()
                    .map_err(|e| format!("invalid header name '{name}': {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { set, remove })
    }
}

#[async_trait]
impl Middleware for SecurityHeadersMiddleware {
    fn name(&self) -> &'static str {
        "security-headers"
    }

    async fn post_response(&self, _ctx: &mut RequestContext, resp: &mut Response<Body>) {
        let headers = resp.headers_mut();
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
    }
}
