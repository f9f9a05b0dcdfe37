//! Immutable, versioned, compiled route snapshots.
//!
//! The route store validates a proposed set with [`validate_route_set`]
//! before publishing it; the proxy engine turns a published [`RouteSet`]
//! into a [`RouteSnapshot`] with [`compile_snapshot`], pre-compiling matcher
//! regexes and middleware chains so the request hot path does no parsing.
//! Snapshots are reference-swapped; an in-flight request keeps the `Arc` it
//! started with.

use std::{collections::HashSet, sync::Arc};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::core::{
    middleware::{self, MiddlewareDeps},
    pipeline::Pipeline,
    route::{MatcherOp, MatcherSource, MatcherSpec, RouteSpec},
};

static ROUTE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]+$").expect("route id pattern is valid"));

const ALLOWED_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "TRACE",
];

/// Why a proposed route set was rejected. The message aggregates every
/// violation found so operators fix a bad set in one pass.
#[derive(Error, Debug, Clone)]
#[error("route set rejected: {message}")]
pub struct RouteSetError {
    pub message: String,
}

impl RouteSetError {
    fn from_violations(violations: Vec<String>) -> Self {
        Self {
            message: violations.join("; "),
        }
    }
}

/// Validate a whole route set. Returns `Ok(())` only when every route
/// satisfies the data-model invariants, every matcher regex compiles, and
/// every middleware name and config is recognized.
pub fn validate_route_set(routes: &[RouteSpec]) -> Result<(), RouteSetError> {
    let mut violations = Vec::new();
    let mut seen_ids = HashSet::new();

    for route in routes {
        let id = &route.id;
        if !ROUTE_ID_RE.is_match(id) {
            violations.push(format!("route id '{id}' must match ^[a-z0-9-]+$"));
        }
        if !seen_ids.insert(id.clone()) {
            violations.push(format!("duplicate route id '{id}'"));
        }
        if !route.path.starts_with('/') {
            violations.push(format!("route '{id}': path must begin with '/'"));
        }
        if route.timeout_ms == 0 {
            violations.push(format!("route '{id}': timeout_ms must be greater than 0"));
        }
        for method in &route.methods {
            if !ALLOWED_METHODS
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method))
            {
                violations.push(format!("route '{id}': invalid HTTP method '{method}'"));
            }
        }

        if route.backends.is_empty() {
            violations.push(format!("route '{id}': backends must not be empty"));
        }
        for backend in &route.backends {
            match backend.url.parse::<http::Uri>() {
                Ok(uri) => {
                    let scheme_ok = matches!(uri.scheme_str(), Some("http") | Some("https"));
                    if !scheme_ok || uri.host().is_none() {
                        violations.push(format!(
                            "route '{id}': backend url '{}' must be absolute http(s) with a host",
                            backend.url
                        ));
                    }
                }
                Err(e) => violations.push(format!(
                    "route '{id}': backend url '{}' is invalid: {e}",
                    backend.url
                )),
            }
            if !(1..=1000).contains(&backend.weight) {
                violations.push(format!(
                    "route '{id}': backend weight {} outside 1..=1000",
                    backend.weight
                ));
            }
            if let Some(hc) = &backend.health_check {
                if hc.interval_ms == 0 || hc.timeout_ms == 0 {
                    violations.push(format!(
                        "route '{id}': health check interval_ms and timeout_ms must be > 0"
                    ));
                }
                if hc.healthy_threshold == 0 || hc.unhealthy_threshold == 0 {
                    violations.push(format!("route '{id}': health check thresholds must be > 0"));
                }
            }
        }

        let retry = &route.retry_policy;
        if retry.max_retries > 10 {
            violations.push(format!("route '{id}': max_retries must be <= 10"));
        }
        if retry.backoff_multiplier < 1.0 {
            violations.push(format!("route '{id}': backoff_multiplier must be >= 1.0"));
        }

        let cb = &route.circuit_breaker;
        if !(1..=100).contains(&cb.failure_threshold_percent) {
            violations.push(format!(
                "route '{id}': failure_threshold_percent outside 1..=100"
            ));
        }
        if cb.minimum_requests == 0 {
            violations.push(format!("route '{id}': minimum_requests must be >= 1"));
        }
        if cb.half_open_max_probes == 0 {
            violations.push(format!("route '{id}': half_open_max_probes must be >= 1"));
        }

        for matcher in &route.matchers {
            if matcher.key.is_empty() {
                violations.push(format!("route '{id}': matcher key must not be empty"));
            }
            if matcher.op == MatcherOp::Regex {
                if let Err(e) = compile_anchored(&matcher.value) {
                    violations.push(format!(
                        "route '{id}': matcher regex '{}' is invalid: {e}",
                        matcher.value
                    ));
                }
            }
        }

        for spec in &route.middleware {
            if let Err(e) = middleware::validate_spec(spec) {
                violations.push(format!("route '{id}': {e}"));
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(RouteSetError::from_violations(violations))
    }
}

/// Anchor a matcher regex at both ends unless the pattern already carries
/// its own anchors.
fn compile_anchored(pattern: &str) -> Result<Regex, regex::Error> {
    let anchored = match (pattern.starts_with('^'), pattern.ends_with('$')) {
        (true, true) => pattern.to_string(),
        (true, false) => format!("{pattern}$"),
        (false, true) => format!("^{pattern}"),
        (false, false) => format!("^{pattern}$"),
    };
    Regex::new(&anchored)
}

/// A matcher with its comparison pre-compiled.
#[derive(Debug, Clone)]
pub struct CompiledMatcher {
    pub source: MatcherSource,
    pub key: String,
    pub op: CompiledOp,
}

#[derive(Debug, Clone)]
pub enum CompiledOp {
    Equals(String),
    Contains(String),
    Prefix(String),
    Suffix(String),
    Regex(Regex),
    Exists,
}

impl CompiledMatcher {
    fn compile(spec: &MatcherSpec) -> Result<Self, regex::Error> {
        let op = match spec.op {
            MatcherOp::Equals => CompiledOp::Equals(spec.value.clone()),
            MatcherOp::Contains => CompiledOp::Contains(spec.value.clone()),
            MatcherOp::Prefix => CompiledOp::Prefix(spec.value.clone()),
            MatcherOp::Suffix => CompiledOp::Suffix(spec.value.clone()),
            MatcherOp::Regex => CompiledOp::Regex(compile_anchored(&spec.value)?),
            MatcherOp::Exists => CompiledOp::Exists,
        };
        Ok(Self {
            source: spec.source,
            key: spec.key.clone(),
            op,
        })
    }

    /// Apply the comparison to the first value found for the key, or to
    /// bare presence for `exists`.
    pub fn holds(&self, value: Option<&str>) -> bool {
        match (&self.op, value) {
            (CompiledOp::Exists, v) => v.is_some(),
            (_, None) => false,
            (CompiledOp::Equals(expected), Some(v)) => v == expected,
            (CompiledOp::Contains(needle), Some(v)) => v.contains(needle.as_str()),
            (CompiledOp::Prefix(prefix), Some(v)) => v.starts_with(prefix.as_str()),
            (CompiledOp::Suffix(suffix), Some(v)) => v.ends_with(suffix.as_str()),
            (CompiledOp::Regex(re), Some(v)) => re.is_match(v),
        }
    }
}

/// One route with everything the hot path needs precomputed.
pub struct CompiledRoute {
    pub spec: Arc<RouteSpec>,
    pub matchers: Vec<CompiledMatcher>,
    pub pipeline: Arc<Pipeline>,
    /// Sum of backend weights, used for sticky hashing.
    pub total_weight: u64,
}

/// An immutable compiled view over one published route set version.
pub struct RouteSnapshot {
    pub version: u64,
    /// Sorted by (priority ascending, id ascending) so the router's linear
    /// scan can stop at the first full match.
    pub routes: Vec<Arc<CompiledRoute>>,
}

impl RouteSnapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            routes: Vec::new(),
        }
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Every (route id, backend) pair in the snapshot, for prober and
    /// circuit reconciliation.
    pub fn backends(&self) -> impl Iterator<Item = (&str, &crate::core::route::BackendSpec)> {
        self.routes.iter().flat_map(|route| {
            route
                .spec
                .backends
                .iter()
                .map(move |backend| (route.spec.id.as_str(), backend))
        })
    }
}

/// Compile a validated route set into a snapshot, constructing middleware
/// chains against `deps`.
pub fn compile_snapshot(
    version: u64,
    specs: &[RouteSpec],
    deps: &MiddlewareDeps,
) -> Result<RouteSnapshot, RouteSetError> {
    let mut routes = Vec::with_capacity(specs.len());
    for spec in specs {
        let matchers = spec
            .matchers
            .iter()
            .map(CompiledMatcher::compile)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RouteSetError {
                message: format!("route '{}': matcher regex failed to compile: {e}", spec.id),
            })?;

        let chain = spec
            .middleware
            .iter()
            .map(|mw| middleware::build(mw, deps))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RouteSetError {
                message: format!("route '{}': {e}", spec.id),
            })?;

        let total_weight = spec.backends.iter().map(|b| u64::from(b.weight)).sum();

        routes.push(Arc::new(CompiledRoute {
            spec: Arc::new(spec.clone()),
            matchers,
            pipeline: Arc::new(Pipeline::new(chain)),
            total_weight,
        }));
    }

    routes.sort_by(|a, b| {
        a.spec
            .priority
            .cmp(&b.spec.priority)
            .then_with(|| a.spec.id.cmp(&b.spec.id))
    });

    Ok(RouteSnapshot { version, routes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::route::{MiddlewareSpec, RouteSpec};

    #[test]
    fn test_valid_minimal_set() {
        let routes = vec![RouteSpec::new("echo", "/e", "http://b:1")];
        assert!(validate_route_set(&routes).is_ok());
    }

    #[test]
    fn test_bad_id_rejected() {
        let routes = vec![RouteSpec::new("Echo_Route", "/e", "http://b:1")];
        let err = validate_route_set(&routes).unwrap_err();
        assert!(err.message.contains("^[a-z0-9-]+$"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let routes = vec![
            RouteSpec::new("echo", "/a", "http://b:1"),
            RouteSpec::new("echo", "/b", "http://b:2"),
        ];
        let err = validate_route_set(&routes).unwrap_err();
        assert!(err.message.contains("duplicate route id"));
    }

    #[test]
    fn test_bad_backend_url_rejected() {
        let routes = vec![RouteSpec::new("echo", "/e", "ftp://b:1")];
        assert!(validate_route_set(&routes).is_err());

        let routes = vec![RouteSpec::new("echo", "/e", "not a url")];
        assert!(validate_route_set(&routes).is_err());
    }

    #[test]
    fn test_weight_bounds() {
        let mut route = RouteSpec::new("echo", "/e", "http://b:1");
        route.backends[0].weight = 0;
        assert!(validate_route_set(&[route.clone()]).is_err());
        route.backends[0].weight = 1001;
        assert!(validate_route_set(&[route]).is_err());
    }

    #[test]
    fn test_invalid_matcher_regex_rejected_at_apply() {
        let mut route = RouteSpec::new("echo", "/e", "http://b:1");
        route.matchers.push(MatcherSpec {
            source: MatcherSource::Header,
            key: "X-K".into(),
            value: "[".into(),
            op: MatcherOp::Regex,
        });
        let err = validate_route_set(&[route]).unwrap_err();
        assert!(err.message.contains("matcher regex"));
    }

    #[test]
    fn test_unknown_middleware_rejected_at_apply() {
        let mut route = RouteSpec::new("echo", "/e", "http://b:1");
        route.middleware.push(MiddlewareSpec {
            name: "waf".into(),
            config: serde_json::Value::Null,
        });
        let err = validate_route_set(&[route]).unwrap_err();
        assert!(err.message.contains("unknown middleware"));
    }

    #[test]
    fn test_regex_matcher_is_anchored_implicitly() {
        let matcher = CompiledMatcher::compile(&MatcherSpec {
            source: MatcherSource::Header,
            key: "X-V".into(),
            value: "v[12]".into(),
            op: MatcherOp::Regex,
        })
        .unwrap();
        assert!(matcher.holds(Some("v1")));
        assert!(!matcher.holds(Some("av1b")));
    }

    #[test]
    fn test_regex_matcher_keeps_explicit_anchors() {
        let matcher = CompiledMatcher::compile(&MatcherSpec {
            source: MatcherSource::Header,
            key: "X-V".into(),
            value: "^v".into(),
            op: MatcherOp::Regex,
        })
        .unwrap();
        assert!(matcher.holds(Some("version")));
    }

    #[test]
    fn test_exists_ignores_value() {
        let matcher = CompiledMatcher::compile(&MatcherSpec {
            source: MatcherSource::Query,
            key: "debug".into(),
            value: String::new(),
            op: MatcherOp::Exists,
        })
        .unwrap();
        assert!(matcher.holds(Some("")));
        assert!(!matcher.holds(None));
    }
}
