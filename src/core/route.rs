//! Declarative route definitions.
//!
//! These types map directly to the canonical YAML route documents
//! (`apiVersion: harbor.l8e/v1, kind: Route`) as well as the JSON shape the
//! route stores persist. They are intentionally serde-friendly and carry
//! defaults so minimal specs stay concise. Validation of a whole route set
//! lives in [`crate::core::snapshot`]; nothing here performs I/O.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::FailureKind;

fn default_weight() -> u32 {
    100
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_backoff_ms() -> u64 {
    100
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_failure_threshold_percent() -> u8 {
    50
}

fn default_minimum_requests() -> u32 {
    20
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_probes() -> u32 {
    1
}

fn default_probe_interval_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_expected_status() -> Vec<u16> {
    vec![200]
}

/// Active health probe settings for a single backend.
///
/// A backend without a `health_check` block is treated as permanently
/// healthy; it never gets a prober task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckSpec {
    /// Probe path appended to the backend URL.
    pub path: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Consecutive successes required for UNKNOWN|DOWN -> UP.
    pub healthy_threshold: u32,
    /// Consecutive failures required for UNKNOWN|UP -> DOWN.
    pub unhealthy_threshold: u32,
    /// Statuses counted as a successful probe.
    pub expected_status: Vec<u16>,
    /// Extra headers sent with each probe.
    pub headers: BTreeMap<String, String>,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            interval_ms: default_probe_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            expected_status: default_expected_status(),
            headers: BTreeMap::new(),
        }
    }
}

/// Transport options for HTTPS backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BackendTlsSpec {
    /// Verify the upstream certificate chain (disable only for dev).
    pub verify: Option<bool>,
    /// Secret name holding an extra CA bundle.
    pub ca_cert: Option<String>,
    /// Secret name holding a client certificate for mutual TLS.
    pub client_cert: Option<String>,
}

/// An upstream destination within a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Absolute HTTP/HTTPS URL with host and optional port.
    pub url: String,
    /// Relative selection weight, 1..=1000.
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<BackendTlsSpec>,
}

impl BackendSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            weight: default_weight(),
            health_check: None,
            tls: None,
        }
    }
}

/// Retry behaviour around upstream attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first, 0..=10.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub backoff_ms: u64,
    /// Multiplier applied per attempt; >= 1.0.
    pub backoff_multiplier: f64,
    /// Ceiling on a single computed delay.
    pub max_backoff_ms: u64,
    /// Failure classes that permit a retry.
    pub retry_on: Vec<FailureKind>,
    /// Route-level opt-in to retry POST/PATCH without an Idempotency-Key.
    pub allow_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            retry_on: Vec::new(),
            allow_non_idempotent: false,
        }
    }
}

/// Circuit breaker thresholds for each (route, backend) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerPolicy {
    pub enabled: bool,
    /// Failure percentage that opens the circuit, 1..=100.
    pub failure_threshold_percent: u8,
    /// Minimum samples in the window before the threshold applies.
    pub minimum_requests: u32,
    /// Length of the tumbling accounting window.
    pub window_ms: u64,
    /// Time spent OPEN before probing again.
    pub open_timeout_ms: u64,
    /// Concurrent trial requests admitted while HALF_OPEN.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold_percent: default_failure_threshold_percent(),
            minimum_requests: default_minimum_requests(),
            window_ms: default_window_ms(),
            open_timeout_ms: default_open_timeout_ms(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

/// Where a matcher reads its input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherSource {
    Header,
    Query,
}

/// Comparison applied by a matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherOp {
    Equals,
    Contains,
    Regex,
    Prefix,
    Suffix,
    Exists,
}

/// An additional predicate refining route selection. All matchers on a
/// route must hold for the route to be eligible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherSpec {
    pub source: MatcherSource,
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub op: MatcherOp,
}

/// A named middleware with its free-form configuration. The name is
/// resolved against the registry at apply time; unknown names reject the
/// whole route set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiddlewareSpec {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// The unit of dispatch: request predicates plus processing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Stable identifier matching `^[a-z0-9-]+$`.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Path prefix; must begin with `/`.
    pub path: String,
    /// Permitted methods; empty means any.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Lower value wins; ties break on ascending `id`.
    #[serde(default)]
    pub priority: i32,
    /// Remove the matched prefix before forwarding.
    #[serde(default)]
    pub strip_prefix: bool,
    /// Prefix prepended to the upstream path after any stripping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_prefix: Option<String>,
    /// Budget for one upstream attempt, not the whole retry envelope.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Pin requests carrying the session cookie to one backend.
    #[serde(default)]
    pub sticky_session: bool,
    /// Cookie name for stickiness, overriding the gateway default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_cookie: Option<String>,
    #[serde(default)]
    pub matchers: Vec<MatcherSpec>,
    pub backends: Vec<BackendSpec>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerPolicy,
    #[serde(default)]
    pub middleware: Vec<MiddlewareSpec>,
    /// Audit timestamps; never consulted during dispatch.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl RouteSpec {
    /// Minimal route used pervasively by tests and examples.
    pub fn new(id: impl Into<String>, path: impl Into<String>, backend_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            path: path.into(),
            methods: Vec::new(),
            priority: 0,
            strip_prefix: false,
            add_prefix: None,
            timeout_ms: default_timeout_ms(),
            sticky_session: false,
            session_cookie: None,
            matchers: Vec::new(),
            backends: vec![BackendSpec::new(backend_url)],
            retry_policy: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerPolicy::default(),
            middleware: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// True when the method set permits `method` (empty set permits all).
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

pub const ROUTE_API_VERSION: &str = "harbor.l8e/v1";
pub const ROUTE_KIND: &str = "Route";

fn default_api_version() -> String {
    ROUTE_API_VERSION.to_string()
}

fn default_kind() -> String {
    ROUTE_KIND.to_string()
}

/// `metadata` block of a canonical route document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMetadata {
    pub name: String,
}

/// The canonical YAML document form of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDocument {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub metadata: RouteMetadata,
    pub spec: RouteSpec,
}

impl RouteDocument {
    pub fn from_spec(spec: RouteSpec) -> Self {
        Self {
            api_version: ROUTE_API_VERSION.to_string(),
            kind: ROUTE_KIND.to_string(),
            metadata: RouteMetadata {
                name: spec.id.clone(),
            },
            spec,
        }
    }

    /// Serialize to canonical YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Parse from canonical YAML.
    pub fn from_yaml(input: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(input)
    }
}
