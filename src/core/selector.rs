//! Weighted backend selection honoring health state and stickiness.

use std::{
    collections::HashSet,
    hash::{Hash, Hasher},
    sync::Arc,
};

use rand::Rng;

use crate::core::{
    errors::{ProxyError, ProxyResult},
    health::{BackendHealth, HealthRegistry},
    route::BackendSpec,
    snapshot::CompiledRoute,
};

/// A selected backend plus its runtime state handle, so the caller can
/// track in-flight counts without another registry lookup.
#[derive(Debug)]
pub struct BackendChoice {
    pub backend: BackendSpec,
    pub health: Arc<BackendHealth>,
}

/// Choose one backend for an upstream attempt.
///
/// Eligibility excludes DOWN backends only; UNKNOWN counts as healthy until
/// the first probe concludes. `sticky_value` (the session cookie) maps onto
/// the weight ring deterministically, falling back to weighted random when
/// the resolved backend is ineligible. `exclude` holds already-attempted
/// URLs; it is honored only while another eligible backend remains.
pub async fn select_backend(
    route: &CompiledRoute,
    registry: &HealthRegistry,
    sticky_value: Option<&str>,
    exclude: &HashSet<String>,
) -> ProxyResult<BackendChoice> {
    let spec = &route.spec;

    let mut eligible: Vec<(&BackendSpec, Arc<BackendHealth>)> =
        Vec::with_capacity(spec.backends.len());
    for backend in &spec.backends {
        let health = registry.get_or_insert(&backend.url).await;
        if health.is_eligible() {
            eligible.push((backend, health));
        }
    }

    if eligible.is_empty() {
        return Err(ProxyError::NoHealthyBackend {
            route_id: spec.id.clone(),
        });
    }

    if let Some(cookie) = sticky_value {
        // The ring spans all backends (healthy or not) so assignments stay
        // stable while a backend flaps.
        if let Some(url) = resolve_sticky(spec.backends.as_slice(), route.total_weight, cookie) {
            if let Some((backend, health)) = eligible
                .iter()
                .find(|(b, _)| b.url == url && !exclude.contains(&b.url))
            {
                return Ok(BackendChoice {
                    backend: (*backend).clone(),
                    health: health.clone(),
                });
            }
            // Resolved backend is DOWN or already tried; fall through to
            // weighted random among the remaining eligible set.
        }
    }

    let mut candidates: Vec<&(&BackendSpec, Arc<BackendHealth>)> = eligible
        .iter()
        .filter(|(b, _)| !exclude.contains(&b.url))
        .collect();
    if candidates.is_empty() {
        // Everything eligible was already attempted; reuse is better than
        // failing outright.
        candidates = eligible.iter().collect();
    }

    let total: u64 = candidates.iter().map(|(b, _)| u64::from(b.weight)).sum();
    let mut point = rand::rng().random_range(0..total);
    for (backend, health) in &candidates {
        let weight = u64::from(backend.weight);
        if point < weight {
            return Ok(BackendChoice {
                backend: (*backend).clone(),
                health: health.clone(),
            });
        }
        point -= weight;
    }

    // Unreachable with a correct cumulative walk; keep a safe fallback.
    let (backend, health) = candidates[candidates.len() - 1];
    Ok(BackendChoice {
        backend: (*backend).clone(),
        health: health.clone(),
    })
}

/// Map a cookie onto the cumulative weight ring.
fn resolve_sticky(backends: &[BackendSpec], total_weight: u64, cookie: &str) -> Option<String> {
    if total_weight == 0 {
        return None;
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    cookie.hash(&mut hasher);
    let mut point = hasher.finish() % total_weight;
    for backend in backends {
        let weight = u64::from(backend.weight);
        if point < weight {
            return Some(backend.url.clone());
        }
        point -= weight;
    }
    None
}
