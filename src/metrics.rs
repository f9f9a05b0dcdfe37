//! Metrics helpers for the l8e-harbor data plane.
//!
//! Thin convenience functions and RAII timers over the `metrics` crate
//! macros. No exporter is embedded; the application installs any compatible
//! recorder (the scrape endpoint is an external collaborator), but the
//! metric names below are a stable contract.
//!
//! Counters:
//! * `l8e_proxy_requests_total` {route_id, method, status, backend}
//! * `l8e_auth_attempts_total` {adapter, status}
//! * `l8e_rate_limit_events_total` {route_id, event}
//! * `l8e_circuit_breaker_events_total` {route_id, backend, event}
//!
//! Histograms:
//! * `l8e_proxy_request_duration_seconds` {route_id, backend}
//! * `l8e_proxy_request_size_bytes` {route_id}
//! * `l8e_proxy_response_size_bytes` {route_id}
//!
//! Gauges:
//! * `l8e_backend_up` {backend} (1 up, 0 down)
//! * `l8e_circuit_breaker_state` {route_id, backend} (0 closed, 1 half-open, 2 open)
//! * `l8e_routes_total`
//! * `l8e_proxy_active_connections`

use std::time::Instant;

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const PROXY_REQUESTS_TOTAL: &str = "l8e_proxy_requests_total";
pub const PROXY_REQUEST_DURATION_SECONDS: &str = "l8e_proxy_request_duration_seconds";
pub const PROXY_REQUEST_SIZE_BYTES: &str = "l8e_proxy_request_size_bytes";
pub const PROXY_RESPONSE_SIZE_BYTES: &str = "l8e_proxy_response_size_bytes";
pub const AUTH_ATTEMPTS_TOTAL: &str = "l8e_auth_attempts_total";
pub const RATE_LIMIT_EVENTS_TOTAL: &str = "l8e_rate_limit_events_total";
pub const CIRCUIT_BREAKER_EVENTS_TOTAL: &str = "l8e_circuit_breaker_events_total";
pub const BACKEND_UP: &str = "l8e_backend_up";
pub const CIRCUIT_BREAKER_STATE: &str = "l8e_circuit_breaker_state";
pub const ROUTES_TOTAL: &str = "l8e_routes_total";
pub const ACTIVE_CONNECTIONS: &str = "l8e_proxy_active_connections";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        PROXY_REQUESTS_TOTAL,
        Unit::Count,
        "Total proxy requests processed."
    );
    describe_histogram!(
        PROXY_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "End-to-end request latency."
    );
    describe_histogram!(
        PROXY_REQUEST_SIZE_BYTES,
        Unit::Bytes,
        "Inbound request body size."
    );
    describe_histogram!(
        PROXY_RESPONSE_SIZE_BYTES,
        Unit::Bytes,
        "Outbound response body size."
    );
    describe_counter!(
        AUTH_ATTEMPTS_TOTAL,
        Unit::Count,
        "Authentication attempts by adapter and outcome."
    );
    describe_counter!(
        RATE_LIMIT_EVENTS_TOTAL,
        Unit::Count,
        "Rate limit decisions per route."
    );
    describe_counter!(
        CIRCUIT_BREAKER_EVENTS_TOTAL,
        Unit::Count,
        "Circuit breaker state transitions."
    );
    describe_gauge!(BACKEND_UP, "Backend health (1 = up, 0 = down).");
    describe_gauge!(
        CIRCUIT_BREAKER_STATE,
        "Circuit state (0 = closed, 1 = half-open, 2 = open)."
    );
    describe_gauge!(ROUTES_TOTAL, "Routes in the active snapshot.");
    describe_gauge!(ACTIVE_CONNECTIONS, "In-flight proxied requests.");
});

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIBED);
}

pub fn record_request(route_id: &str, method: &str, status: u16, backend: &str) {
    counter!(
        PROXY_REQUESTS_TOTAL,
        "route_id" => route_id.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string(),
        "backend" => backend.to_string(),
    )
    .increment(1);
}

pub fn record_request_duration(route_id: &str, backend: &str, duration: std::time::Duration) {
    histogram!(
        PROXY_REQUEST_DURATION_SECONDS,
        "route_id" => route_id.to_string(),
        "backend" => backend.to_string(),
    )
    .record(duration.as_secs_f64());
}

pub fn record_request_size(route_id: &str, bytes: u64) {
    histogram!(PROXY_REQUEST_SIZE_BYTES, "route_id" => route_id.to_string()).record(bytes as f64);
}

pub fn record_response_size(route_id: &str, bytes: u64) {
    histogram!(PROXY_RESPONSE_SIZE_BYTES, "route_id" => route_id.to_string()).record(bytes as f64);
}

pub fn record_auth_attempt(adapter: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        AUTH_ATTEMPTS_TOTAL,
        "adapter" => adapter.to_string(),
        "status" => status,
    )
    .increment(1);
}

pub fn record_rate_limit_event(route_id: &str, event: &str) {
    counter!(
        RATE_LIMIT_EVENTS_TOTAL,
        "route_id" => route_id.to_string(),
        "event" => event.to_string(),
    )
    .increment(1);
}

pub fn record_circuit_event(route_id: &str, backend: &str, event: &str) {
    counter!(
        CIRCUIT_BREAKER_EVENTS_TOTAL,
        "route_id" => route_id.to_string(),
        "backend" => backend.to_string(),
        "event" => event.to_string(),
    )
    .increment(1);
}

pub fn set_backend_up(backend: &str, up: bool) {
    gauge!(BACKEND_UP, "backend" => backend.to_string()).set(if up { 1.0 } else { 0.0 });
}

pub fn set_circuit_state(route_id: &str, backend: &str, state: u8) {
    gauge!(
        CIRCUIT_BREAKER_STATE,
        "route_id" => route_id.to_string(),
        "backend" => backend.to_string(),
    )
    .set(f64::from(state));
}

pub fn set_routes_total(count: usize) {
    gauge!(ROUTES_TOTAL).set(count as f64);
}

pub fn set_active_connections(count: usize) {
    gauge!(ACTIVE_CONNECTIONS).set(count as f64);
}

/// RAII timer recording request duration even on early return.
pub struct RequestTimer {
    start: Instant,
    route_id: String,
    backend: String,
}

impl RequestTimer {
    pub fn new(route_id: &str) -> Self {
        Self {
            start: Instant::now(),
            route_id: route_id.to_string(),
            backend: String::new(),
        }
    }

    pub fn set_backend(&mut self, backend: &str) {
        self.backend = backend.to_string();
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.route_id, &self.backend, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_recorders_do_not_panic_without_recorder() {
        record_request("echo", "GET", 200, "http://b:1");
        record_auth_attempt("static-token", true);
        record_rate_limit_event("echo", "limited");
        record_circuit_event("echo", "http://b:1", "open");
        set_backend_up("http://b:1", true);
        set_circuit_state("echo", "http://b:1", 2);
        set_routes_total(3);
        set_active_connections(17);
    }

    #[test]
    fn test_request_timer_records_on_drop() {
        let mut timer = RequestTimer::new("echo");
        timer.set_backend("http://b:1");
        drop(timer);
    }
}
