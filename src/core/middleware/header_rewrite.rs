//! `header-rewrite` middleware: set / add / remove request headers before
//! forwarding. Removal is case-insensitive (header names are normalized by
//! the `http` crate).

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::body::Body;
use http::{HeaderName, HeaderValue};
use hyper::Request;
use serde::Deserialize;

use crate::core::{
    context::RequestContext,
    pipeline::{Middleware, PreVerdict},
};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct HeaderRewriteConfig {
    /// Replace the header outright.
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    /// Append a value, keeping any existing ones.
    #[serde(default)]
    pub add: BTreeMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

pub struct HeaderRewriteMiddleware {
    set: Vec<(HeaderName, HeaderValue)>,
    add: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl HeaderRewriteMiddleware {
    pub fn build(config: HeaderRewriteConfig) -> Result<Self, String> {
        let parse_pairs = |map: &BTreeMap<String, String>| {
            map.iter()
                .map(|(name, value)| {
                    let name = name
                        .parse::<HeaderName>()
                        .map_err(|e| format!("invalid header name '{name}': {e}"))?;
                    let value = HeaderValue::from_str(value)
                        .map_err(|e| format!("invalid header value for '{name}': {e}"))?;
                    Ok::<_, String>((name, value))
                })
                .collect::<Result<Vec<_>, _>>()
        };

        let remove = config
            .remove
            .iter()
            .map(|name| {
                name.parse::<HeaderName>()
                    .map_err(|e| format!("invalid header name '{name}': {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            set: parse_pairs(&config.set)?,
            add: parse_pairs(&config.add)?,
            remove,
        })
    }
}

#[async_trait]
impl Middleware for HeaderRewriteMiddleware {
    fn name(&self) -> &'static str {
        "header-rewrite"
    }

    async fn pre_request(&self, _ctx: &mut RequestContext, req: &mut Request<Body>) -> PreVerdict {
        let headers = req.headers_mut();
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.add {
            headers.append(name.clone(), value.clone());
        }
        PreVerdict::Continue
    }
}
