//! Backend health tracking and active probing.
//!
//! Runtime health state lives in a side table keyed by backend URL; routes
//! carry only configuration. Each backend declaring a `health_check` gets a
//! single long-lived probe task. The selector reads health state lock-free
//! and may observe slightly stale values, which is acceptable.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::body::Body;
use hyper::Request;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    core::{route::HealthCheckSpec, snapshot::RouteSnapshot},
    metrics,
    ports::http_client::HttpClient,
};

const STATE_UNKNOWN: u8 = 0;
const STATE_UP: u8 = 1;
const STATE_DOWN: u8 = 2;

/// Probe-driven liveness of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// No probe has concluded yet; treated as eligible to avoid cold-start
    /// blackouts.
    Unknown,
    Up,
    Down,
}

impl HealthState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_UP => HealthState::Up,
            STATE_DOWN => HealthState::Down,
            _ => HealthState::Unknown,
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Unknown => write!(f, "unknown"),
            HealthState::Up => write!(f, "up"),
            HealthState::Down => write!(f, "down"),
        }
    }
}

/// Mutable runtime companion of one backend. Single writer (its prober),
/// many readers (the selector and the health endpoints).
#[derive(Debug)]
pub struct BackendHealth {
    url: String,
    state: AtomicU8,
    consecutive_success: AtomicU32,
    consecutive_failure: AtomicU32,
    last_probe_at_ms: AtomicU64,
    in_flight: AtomicU32,
}

impl BackendHealth {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: AtomicU8::new(STATE_UNKNOWN),
            consecutive_success: AtomicU32::new(0),
            consecutive_failure: AtomicU32::new(0),
            last_probe_at_ms: AtomicU64::new(0),
            in_flight: AtomicU32::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Backends are eligible unless a prober has declared them DOWN.
    pub fn is_eligible(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_DOWN
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_success.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failure.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_request(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    fn mark_probed(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.last_probe_at_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Record a successful probe; returns the new state when a transition
    /// to UP happened.
    pub fn record_probe_success(&self, healthy_threshold: u32) -> Option<HealthState> {
        self.mark_probed();
        let successes = self.consecutive_success.fetch_add(1, Ordering::AcqRel) + 1;
        self.consecutive_failure.store(0, Ordering::Release);

        if successes >= healthy_threshold && self.state.load(Ordering::Acquire) != STATE_UP {
            self.state.store(STATE_UP, Ordering::Release);
            metrics::set_backend_up(&self.url, true);
            return Some(HealthState::Up);
        }
        None
    }

    /// Record a failed probe; returns the new state when a transition to
    /// DOWN happened.
    pub fn record_probe_failure(&self, unhealthy_threshold: u32) -> Option<HealthState> {
        self.mark_probed();
        let failures = self.consecutive_failure.fetch_add(1, Ordering::AcqRel) + 1;
        self.consecutive_success.store(0, Ordering::Release);

        if failures >= unhealthy_threshold && self.state.load(Ordering::Acquire) != STATE_DOWN {
            self.state.store(STATE_DOWN, Ordering::Release);
            metrics::set_backend_up(&self.url, false);
            return Some(HealthState::Down);
        }
        None
    }
}

/// Shared side table of backend runtime state.
#[derive(Default)]
pub struct HealthRegistry {
    backends: scc::HashMap<String, Arc<BackendHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the state for a backend, creating an UNKNOWN entry on first
    /// use.
    pub async fn get_or_insert(&self, url: &str) -> Arc<BackendHealth> {
        if let Some(entry) = self.backends.get_async(url).await {
            return entry.get().clone();
        }
        let health = Arc::new(BackendHealth::new(url));
        match self
            .backends
            .insert_async(url.to_string(), health.clone())
            .await
        {
            Ok(()) => health,
            // Lost the race; take the winner's entry.
            Err(_) => self
                .backends
                .get_async(url)
                .await
                .map(|entry| entry.get().clone())
                .unwrap_or(health),
        }
    }

    pub async fn get(&self, url: &str) -> Option<Arc<BackendHealth>> {
        self.backends.get_async(url).await.map(|e| e.get().clone())
    }

    pub async fn remove(&self, url: &str) {
        let _ = self.backends.remove_async(url).await;
    }

    /// Drop state for every backend not in `live`.
    pub async fn retain(&self, live: &std::collections::HashSet<String>) {
        self.backends
            .retain_async(|url, _| live.contains(url))
            .await;
    }

    /// Snapshot of (url, state) pairs for the detailed health report.
    pub fn summary(&self) -> Vec<(String, HealthState)> {
        let mut out = Vec::new();
        self.backends.iter_sync(|url, health| {
            out.push((url.clone(), health.state()));
            true
        });
        out
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let (mut up, mut down, mut unknown) = (0, 0, 0);
        self.backends.iter_sync(|_, health| {
            match health.state() {
                HealthState::Up => up += 1,
                HealthState::Down => down += 1,
                HealthState::Unknown => unknown += 1,
            }
            true
        });
        (up, down, unknown)
    }
}

struct ProbeTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns one probe task per backend with a configured health check and
/// reconciles the task set against each new snapshot.
pub struct HealthProber {
    registry: Arc<HealthRegistry>,
    client: Arc<dyn HttpClient>,
    tasks: tokio::sync::Mutex<HashMap<String, ProbeTask>>,
}

impl HealthProber {
    pub fn new(registry: Arc<HealthRegistry>, client: Arc<dyn HttpClient>) -> Self {
        Self {
            registry,
            client,
            tasks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Align probe tasks with `snapshot`: start probing new backends, stop
    /// and forget backends that no longer appear in any route.
    pub async fn reconcile(&self, snapshot: &RouteSnapshot) {
        // First health_check spec wins when the same URL appears in several
        // routes; state is keyed per URL.
        let mut desired: HashMap<String, HealthCheckSpec> = HashMap::new();
        let mut all_urls: std::collections::HashSet<String> = std::collections::HashSet::new();
        for (_route_id, backend) in snapshot.backends() {
            all_urls.insert(backend.url.clone());
            if let Some(hc) = &backend.health_check {
                desired.entry(backend.url.clone()).or_insert_with(|| hc.clone());
            }
        }

        let mut tasks = self.tasks.lock().await;

        let stale: Vec<String> = tasks
            .keys()
            .filter(|url| !desired.contains_key(*url))
            .cloned()
            .collect();
        for url in stale {
            if let Some(task) = tasks.remove(&url) {
                tracing::info!(backend = %url, "stopping health probe");
                task.token.cancel();
                task.handle.abort();
            }
        }

        // State for backends gone from every route is discarded, probed
        // or not.
        self.registry.retain(&all_urls).await;

        for (url, spec) in desired {
            if tasks.contains_key(&url) {
                continue;
            }
            let health = self.registry.get_or_insert(&url).await;
            let token = CancellationToken::new();
            let handle = tokio::spawn(probe_loop(
                self.client.clone(),
                health,
                spec.clone(),
                token.clone(),
            ));
            tracing::info!(
                backend = %url,
                interval_ms = spec.interval_ms,
                path = %spec.path,
                "starting health probe"
            );
            tasks.insert(url, ProbeTask { token, handle });
        }
    }

    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, task) in tasks.drain() {
            task.token.cancel();
            task.handle.abort();
        }
    }
}

/// One backend's probe loop. Probes never retry internally and never feed
/// the circuit breaker; only real traffic does.
async fn probe_loop(
    client: Arc<dyn HttpClient>,
    health: Arc<BackendHealth>,
    spec: HealthCheckSpec,
    token: CancellationToken,
) {
    let interval = Duration::from_millis(spec.interval_ms.max(1));
    let timeout = Duration::from_millis(spec.timeout_ms.max(1));
    let probe_url = format!(
        "{}{}",
        health.url().trim_end_matches('/'),
        spec.path
    );

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let mut builder = Request::builder().method("GET").uri(probe_url.as_str());
        for (name, value) in &spec.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = match builder.body(Body::empty()) {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(backend = %health.url(), error = %e, "invalid probe request");
                return;
            }
        };

        let outcome = client.probe(request, timeout).await;
        let success = match outcome {
            Ok(status) => spec.expected_status.contains(&status.as_u16()),
            Err(ref e) => {
                tracing::debug!(backend = %health.url(), error = %e, "probe failed");
                false
            }
        };

        if success {
            if let Some(state) = health.record_probe_success(spec.healthy_threshold) {
                tracing::info!(
                    backend = %health.url(),
                    state = %state,
                    successes = health.consecutive_successes(),
                    "backend transitioned"
                );
            }
        } else if let Some(state) = health.record_probe_failure(spec.unhealthy_threshold) {
            tracing::warn!(
                backend = %health.url(),
                state = %state,
                failures = health.consecutive_failures(),
                "backend transitioned"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_unknown_and_eligible() {
        let health = BackendHealth::new("http://b:1");
        assert_eq!(health.state(), HealthState::Unknown);
        assert!(health.is_eligible());
    }

    #[test]
    fn test_unknown_to_up_requires_threshold() {
        let health = BackendHealth::new("http://b:1");
        assert_eq!(health.record_probe_success(2), None);
        assert_eq!(health.state(), HealthState::Unknown);
        assert_eq!(health.record_probe_success(2), Some(HealthState::Up));
        assert_eq!(health.state(), HealthState::Up);
    }

    #[test]
    fn test_up_to_down_requires_threshold() {
        let health = BackendHealth::new("http://b:1");
        health.record_probe_success(1);
        assert_eq!(health.state(), HealthState::Up);

        assert_eq!(health.record_probe_failure(3), None);
        assert_eq!(health.record_probe_failure(3), None);
        assert_eq!(health.record_probe_failure(3), Some(HealthState::Down));
        assert!(!health.is_eligible());
    }

    #[test]
    fn test_counters_reset_on_opposite_outcome() {
        let health = BackendHealth::new("http://b:1");
        health.record_probe_failure(5);
        health.record_probe_failure(5);
        assert_eq!(health.consecutive_failures(), 2);
        health.record_probe_success(5);
        assert_eq!(health.consecutive_failures(), 0);
        assert_eq!(health.consecutive_successes(), 1);
    }

    #[test]
    fn test_unknown_to_down_directly() {
        let health = BackendHealth::new("http://b:1");
        assert_eq!(health.record_probe_failure(1), Some(HealthState::Down));
    }

    #[tokio::test]
    async fn test_registry_get_or_insert_reuses_entries() {
        let registry = HealthRegistry::new();
        let a = registry.get_or_insert("http://b:1").await;
        let b = registry.get_or_insert("http://b:1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
