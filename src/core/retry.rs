//! Retry engine: bounded exponential backoff with jitter around upstream
//! attempts.
//!
//! The engine owns the attempt loop and the policy math; what one attempt
//! does (select a backend, consult its breaker, forward) is injected, so
//! the loop is testable with plain closures.

use std::{future::Future, time::Duration};

use axum::body::Body;
use hyper::Response;
use rand::Rng;
use tokio::time::Instant;

use crate::core::{
    errors::{ProxyError, ProxyResult},
    route::RetryPolicy,
};

/// Idempotency guard: POST and PATCH replay only with a client-supplied
/// `Idempotency-Key` or an explicit route opt-in; every other method
/// retries according to the policy alone.
pub fn method_allows_retry(
    method: &http::Method,
    headers: &http::HeaderMap,
    policy: &RetryPolicy,
) -> bool {
    match *method {
        http::Method::POST | http::Method::PATCH => {
            policy.allow_non_idempotent || headers.contains_key("idempotency-key")
        }
        _ => true,
    }
}

/// Whether the policy's `retry_on` set names this error's failure class.
pub fn is_retryable(policy: &RetryPolicy, error: &ProxyError) -> bool {
    match error.kind() {
        Some(kind) => policy.retry_on.contains(&kind),
        None => false,
    }
}

/// Jittered delay before retry `n` (0-indexed):
/// `min(backoff_ms * multiplier^n, max_backoff_ms)` scaled by a uniform
/// factor in [0.9, 1.1].
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.backoff_ms as f64 * policy.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(policy.max_backoff_ms as f64);
    let jitter = rand::rng().random_range(0.9..=1.1);
    Duration::from_millis((capped * jitter).round().max(0.0) as u64)
}

/// Upper bound on the whole retry envelope when the client supplies no
/// `X-Request-Timeout-Ms`: worst-case backoff sleeps plus every attempt
/// running to its per-attempt budget, with jitter headroom.
pub fn default_total_budget(policy: &RetryPolicy, timeout_ms: u64) -> Duration {
    let mut sleep_ms = 0.0f64;
    for n in 0..policy.max_retries {
        let base = policy.backoff_ms as f64 * policy.backoff_multiplier.powi(n as i32);
        sleep_ms += base.min(policy.max_backoff_ms as f64);
    }
    let attempts = u64::from(policy.max_retries) + 1;
    Duration::from_millis((sleep_ms * 1.1).round() as u64 + attempts * timeout_ms)
}

/// Drive attempts until success, a non-retryable failure, attempt
/// exhaustion, or the total deadline.
///
/// `attempt(n)` performs attempt `n` (0-indexed) end to end. When
/// `retry_allowed` is false the loop makes exactly one attempt regardless
/// of policy.
pub async fn execute<F, Fut>(
    route_id: &str,
    policy: &RetryPolicy,
    retry_allowed: bool,
    deadline: Instant,
    mut attempt: F,
) -> ProxyResult<Response<Body>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ProxyResult<Response<Body>>>,
{
    let max_attempts = if retry_allowed {
        policy.max_retries + 1
    } else {
        1
    };

    let mut last_error: Option<ProxyError> = None;
    for n in 0..max_attempts {
        if Instant::now() >= deadline {
            break;
        }

        match attempt(n).await {
            Ok(response) => return Ok(response),
            Err(error) => {
                let attempts_left = n + 1 < max_attempts;
                if !attempts_left || !is_retryable(policy, &error) {
                    return Err(error);
                }

                let delay = delay_for_attempt(policy, n);
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(error);
                }
                tracing::info!(
                    route_id,
                    retry_count = n + 1,
                    next_retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying upstream attempt"
                );
                tokio::time::sleep(delay.min(remaining)).await;
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or(ProxyError::Timeout {
        elapsed_ms: deadline.elapsed().as_millis() as u64,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use http::StatusCode;

    use super::*;
    use crate::core::errors::FailureKind;

    fn policy(max_retries: u32, retry_on: Vec<FailureKind>) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_ms: 10,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1_000,
            retry_on,
            allow_non_idempotent: false,
        }
    }

    fn ok_response() -> Response<Body> {
        Response::new(Body::empty())
    }

    #[test]
    fn test_idempotency_guard() {
        let p = policy(2, vec![FailureKind::ServerError]);
        let mut headers = http::HeaderMap::new();
        assert!(method_allows_retry(&http::Method::GET, &headers, &p));
        assert!(method_allows_retry(&http::Method::DELETE, &headers, &p));
        assert!(!method_allows_retry(&http::Method::POST, &headers, &p));

        headers.insert("Idempotency-Key", "k1".parse().unwrap());
        assert!(method_allows_retry(&http::Method::POST, &headers, &p));

        let mut opted_in = policy(2, vec![]);
        opted_in.allow_non_idempotent = true;
        assert!(method_allows_retry(
            &http::Method::PATCH,
            &http::HeaderMap::new(),
            &opted_in
        ));
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let p = RetryPolicy {
            max_retries: 5,
            backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 300,
            retry_on: vec![],
            allow_non_idempotent: false,
        };
        // attempt 0: 100ms base, jitter within +-10%
        let d0 = delay_for_attempt(&p, 0).as_millis() as f64;
        assert!((90.0..=110.0).contains(&d0), "d0 = {d0}");
        // attempt 2 would be 400ms but caps at 300ms
        let d2 = delay_for_attempt(&p, 2).as_millis() as f64;
        assert!((270.0..=330.0).contains(&d2), "d2 = {d2}");
    }

    #[test]
    fn test_default_total_budget() {
        let p = RetryPolicy {
            max_retries: 2,
            backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
            retry_on: vec![],
            allow_non_idempotent: false,
        };
        // sleeps: 100 + 200 = 300, *1.1 = 330; attempts: 3 * 5000
        let budget = default_total_budget(&p, 5_000);
        assert_eq!(budget.as_millis(), 330 + 15_000);
    }

    #[tokio::test]
    async fn test_zero_retries_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let p = policy(0, vec![FailureKind::ServerError]);
        let deadline = Instant::now() + Duration::from_secs(5);

        let started = std::time::Instant::now();
        let result = execute("r", &p, true, deadline, move |_| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProxyError::UpstreamStatus(StatusCode::SERVICE_UNAVAILABLE))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // No sleeps at all.
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let p = policy(2, vec![FailureKind::ServerError]);
        let deadline = Instant::now() + Duration::from_secs(5);

        let result = execute("r", &p, true, deadline, move |_| {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ProxyError::UpstreamStatus(StatusCode::SERVICE_UNAVAILABLE))
                } else {
                    Ok(ok_response())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_surfaces_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let p = policy(3, vec![FailureKind::Timeout]);
        let deadline = Instant::now() + Duration::from_secs(5);

        let result = execute("r", &p, true, deadline, move |_| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProxyError::ConnectionError("refused".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(ProxyError::ConnectionError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_suppresses_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let p = policy(3, vec![FailureKind::ServerError]);
        let deadline = Instant::now() + Duration::from_secs(5);

        let result = execute("r", &p, false, deadline, move |_| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProxyError::UpstreamStatus(StatusCode::INTERNAL_SERVER_ERROR))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_total_sleep_is_bounded() {
        let p = policy(2, vec![FailureKind::ServerError]);
        let deadline = Instant::now() + Duration::from_secs(5);

        let started = std::time::Instant::now();
        let _ = execute("r", &p, true, deadline, move |_| async move {
            Err::<Response<Body>, _>(ProxyError::UpstreamStatus(
                StatusCode::SERVICE_UNAVAILABLE,
            ))
        })
        .await;
        // Sleeps: ~10ms + ~20ms with +-10% jitter.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(18), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(120), "elapsed {elapsed:?}");
    }
}
