//! Per-(route, backend) circuit breaker.
//!
//! A tumbling window of real-traffic outcomes drives the
//! CLOSED/OPEN/HALF_OPEN state machine. Counters for different
//! (route, backend) keys never contend; transitions within one breaker are
//! serialized by a small mutex held only long enough to mutate counters.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use crate::{
    core::{
        errors::{ProxyError, ProxyResult},
        route::CircuitBreakerPolicy,
        snapshot::RouteSnapshot,
    },
    metrics,
};

/// Breaker position. Gauge encoding: 0 closed, 1 half-open, 2 open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn gauge_value(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    window_successes: u32,
    window_failures: u32,
    window_started_at: Instant,
    opened_at: Option<Instant>,
    half_open_outstanding: u32,
    half_open_successes: u32,
}

/// Marker returned by [`CircuitBreaker::try_acquire`]; hand it back to
/// [`CircuitBreaker::record`] so half-open probe slots are released exactly
/// once.
#[derive(Debug, Clone, Copy)]
pub struct CircuitPermit {
    half_open_probe: bool,
}

pub struct CircuitBreaker {
    route_id: String,
    backend: String,
    policy: CircuitBreakerPolicy,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        route_id: impl Into<String>,
        backend: impl Into<String>,
        policy: CircuitBreakerPolicy,
    ) -> Self {
        Self {
            route_id: route_id.into(),
            backend: backend.into(),
            policy,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window_successes: 0,
                window_failures: 0,
                window_started_at: Instant::now(),
                opened_at: None,
                half_open_outstanding: 0,
                half_open_successes: 0,
            }),
        }
    }

    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().map(|inner| inner.state).unwrap_or(CircuitState::Closed)
    }

    /// Ask for permission to attempt the backend.
    pub fn try_acquire(&self) -> ProxyResult<CircuitPermit> {
        if !self.policy.enabled {
            return Ok(CircuitPermit {
                half_open_probe: false,
            });
        }

        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match inner.state {
            CircuitState::Closed => {
                self.roll_window_if_due(&mut inner);
                Ok(CircuitPermit {
                    half_open_probe: false,
                })
            }
            CircuitState::Open => {
                let elapsed_ms = inner
                    .opened_at
                    .map(|at| at.elapsed().as_millis() as u64)
                    .unwrap_or(u64::MAX);
                if elapsed_ms >= self.policy.open_timeout_ms {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_outstanding = 1;
                    inner.half_open_successes = 0;
                    Ok(CircuitPermit {
                        half_open_probe: true,
                    })
                } else {
                    Err(ProxyError::CircuitOpen {
                        backend: self.backend.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_outstanding < self.policy.half_open_max_probes {
                    inner.half_open_outstanding += 1;
                    Ok(CircuitPermit {
                        half_open_probe: true,
                    })
                } else {
                    Err(ProxyError::CircuitOpen {
                        backend: self.backend.clone(),
                    })
                }
            }
        }
    }

    /// Release a permit without recording an outcome. Used when the
    /// attempt ended for reasons that say nothing about the backend
    /// (client cancellation).
    pub fn release(&self, permit: CircuitPermit) {
        if !self.policy.enabled || !permit.half_open_probe {
            return;
        }
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_outstanding = inner.half_open_outstanding.saturating_sub(1);
        }
    }

    /// Record the outcome of an attempt that was admitted by
    /// [`try_acquire`]. 4xx responses other than 408 must be recorded as
    /// successes; the caller's classifier handles that.
    pub fn record(&self, permit: CircuitPermit, success: bool) {
        if !self.policy.enabled {
            return;
        }

        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match inner.state {
            CircuitState::Closed => {
                self.roll_window_if_due(&mut inner);
                if success {
                    inner.window_successes += 1;
                } else {
                    inner.window_failures += 1;
                    let total = inner.window_successes + inner.window_failures;
                    if total >= self.policy.minimum_requests {
                        let rate = f64::from(inner.window_failures) / f64::from(total) * 100.0;
                        if rate >= f64::from(self.policy.failure_threshold_percent) {
                            self.transition(&mut inner, CircuitState::Open);
                            inner.opened_at = Some(Instant::now());
                            inner.window_successes = 0;
                            inner.window_failures = 0;
                        }
                    }
                }
            }
            CircuitState::HalfOpen => {
                if permit.half_open_probe {
                    inner.half_open_outstanding = inner.half_open_outstanding.saturating_sub(1);
                }
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.policy.half_open_max_probes {
                        self.transition(&mut inner, CircuitState::Closed);
                        inner.opened_at = None;
                        inner.window_successes = 0;
                        inner.window_failures = 0;
                        inner.window_started_at = Instant::now();
                    }
                } else {
                    self.transition(&mut inner, CircuitState::Open);
                    inner.opened_at = Some(Instant::now());
                    inner.half_open_outstanding = 0;
                    inner.half_open_successes = 0;
                }
            }
            // A late result from an attempt that started before the breaker
            // opened; the fresh window ignores it.
            CircuitState::Open => {}
        }
    }

    fn roll_window_if_due(&self, inner: &mut Inner) {
        if inner.window_started_at.elapsed().as_millis() as u64 >= self.policy.window_ms {
            inner.window_started_at = Instant::now();
            inner.window_successes = 0;
            inner.window_failures = 0;
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        metrics::set_circuit_state(&self.route_id, &self.backend, to.gauge_value());
        metrics::record_circuit_event(&self.route_id, &self.backend, &to.to_string());
        tracing::info!(
            route_id = %self.route_id,
            backend = %self.backend,
            from = %from,
            to = %to,
            "circuit transition"
        );
    }
}

/// Side table of breakers keyed by (route id, backend url).
#[derive(Default)]
pub struct CircuitRegistry {
    breakers: scc::HashMap<(String, String), Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the breaker for a pair, creating it on first use. A policy
    /// change in a newer snapshot replaces the breaker (state resets).
    pub async fn get_or_insert(
        &self,
        route_id: &str,
        backend: &str,
        policy: &CircuitBreakerPolicy,
    ) -> Arc<CircuitBreaker> {
        let key = (route_id.to_string(), backend.to_string());
        if let Some(entry) = self.breakers.get_async(&key).await {
            if entry.get().policy() == policy {
                return entry.get().clone();
            }
        }
        let breaker = Arc::new(CircuitBreaker::new(route_id, backend, policy.clone()));
        let _ = self.breakers.remove_async(&key).await;
        match self.breakers.insert_async(key.clone(), breaker.clone()).await {
            Ok(()) => breaker,
            Err(_) => self
                .breakers
                .get_async(&key)
                .await
                .map(|entry| entry.get().clone())
                .unwrap_or(breaker),
        }
    }

    /// Drop breakers whose (route, backend) pair vanished from the
    /// snapshot.
    pub async fn reconcile(&self, snapshot: &RouteSnapshot) {
        let mut live: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();
        for (route_id, backend) in snapshot.backends() {
            live.insert((route_id.to_string(), backend.url.clone()));
        }
        self.breakers
            .retain_async(|key, _| live.contains(key))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn policy(window_ms: u64, open_timeout_ms: u64) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy {
            enabled: true,
            failure_threshold_percent: 50,
            minimum_requests: 10,
            window_ms,
            open_timeout_ms,
            half_open_max_probes: 1,
        }
    }

    #[test]
    fn test_disabled_breaker_always_admits() {
        let breaker = CircuitBreaker::new("r", "http://b:1", CircuitBreakerPolicy::default());
        for _ in 0..100 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record(permit, false);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_after_threshold_within_window() {
        let breaker = CircuitBreaker::new("r", "http://b:1", policy(1_000, 500));
        for _ in 0..10 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record(permit, false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.try_acquire(),
            Err(ProxyError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_does_not_open_below_minimum_requests() {
        let breaker = CircuitBreaker::new("r", "http://b:1", policy(1_000, 500));
        for _ in 0..9 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record(permit, false);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_does_not_open_below_failure_rate() {
        let breaker = CircuitBreaker::new("r", "http://b:1", policy(60_000, 500));
        for i in 0..20 {
            let permit = breaker.try_acquire().unwrap();
            // 40% failures, below the 50% threshold.
            breaker.record(permit, i % 5 < 3);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout_and_probe_cap() {
        let mut p = policy(1_000, 50);
        p.half_open_max_probes = 2;
        let breaker = CircuitBreaker::new("r", "http://b:1", p);
        for _ in 0..10 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record(permit, false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));

        let first = breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let second = breaker.try_acquire().unwrap();
        // Both probe slots are taken.
        assert!(breaker.try_acquire().is_err());

        breaker.record(first, true);
        breaker.record(second, true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("r", "http://b:1", policy(1_000, 50));
        for _ in 0..10 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record(permit, false);
        }
        std::thread::sleep(Duration::from_millis(60));

        let probe = breaker.try_acquire().unwrap();
        breaker.record(probe, false);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_window_roll_resets_counts() {
        let breaker = CircuitBreaker::new("r", "http://b:1", policy(30, 500));
        for _ in 0..5 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record(permit, false);
        }
        std::thread::sleep(Duration::from_millis(40));
        // New window: five failures here are below minimum_requests again.
        for _ in 0..5 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record(permit, false);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_registry_replaces_breaker_on_policy_change() {
        let registry = CircuitRegistry::new();
        let a = registry
            .get_or_insert("r", "http://b:1", &policy(1_000, 500))
            .await;
        let b = registry
            .get_or_insert("r", "http://b:1", &policy(1_000, 500))
            .await;
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry
            .get_or_insert("r", "http://b:1", &policy(2_000, 500))
            .await;
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
