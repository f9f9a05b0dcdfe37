//! Data-plane error taxonomy and its mapping onto client-facing statuses.
//!
//! Every fault the forwarder, selector or circuit breaker can surface is a
//! `ProxyError` variant. The retry engine consults [`ProxyError::kind`] to
//! decide whether a policy permits another attempt; the ingress handler uses
//! [`ProxyError::client_status`] to build the final response.

use http::StatusCode;
use thiserror::Error;

/// Failure classes referenced by `retry_on` sets and circuit accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Any 5xx response from the upstream.
    #[serde(rename = "5xx")]
    ServerError,
    /// 502/503/504 from the upstream, or a locally open circuit.
    GatewayError,
    /// Per-attempt budget exceeded before the first response byte.
    Timeout,
    /// DNS, connect or handshake failure.
    ConnectionError,
    /// Connection reset by the upstream mid-exchange.
    Reset,
}

/// Errors surfaced by the proxy data plane.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    /// No route matched the request.
    #[error("no route matched")]
    NoRouteMatched,

    /// Every backend of the route is DOWN or excluded.
    #[error("no healthy backend for route '{route_id}'")]
    NoHealthyBackend { route_id: String },

    /// Circuit breaker rejected the attempt without contacting the backend.
    #[error("circuit open for backend '{backend}'")]
    CircuitOpen { backend: String },

    /// Per-attempt budget elapsed before the upstream produced headers.
    #[error("upstream attempt timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// TCP/DNS level failure reaching the upstream.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// TLS negotiation with the upstream failed.
    #[error("tls error: {0}")]
    TlsError(String),

    /// The upstream reset the connection mid-exchange.
    #[error("connection reset: {0}")]
    Reset(String),

    /// The upstream answered with a status the policy treats as a failure.
    #[error("upstream returned status {0}")]
    UpstreamStatus(StatusCode),

    /// The client went away; logged as 499, never returned.
    #[error("request canceled")]
    Canceled,

    /// Process-level overload (in-flight semaphore exhausted).
    #[error("gateway overloaded")]
    Overloaded,

    /// Middleware rejected the request with a concrete status.
    #[error("middleware rejected request with {status}")]
    MiddlewareRejection { status: StatusCode, message: String },

    /// Middleware failed internally (the `Fail` verdict).
    #[error("middleware '{middleware}' failed: {message}")]
    MiddlewareFailure { middleware: String, message: String },
}

impl ProxyError {
    /// Classify this error for retry and circuit-breaker accounting.
    ///
    /// Returns `None` for errors that are neither retryable nor counted
    /// against a backend (routing misses, client cancellation, overload).
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            ProxyError::Timeout { .. } => Some(FailureKind::Timeout),
            ProxyError::ConnectionError(_) | ProxyError::TlsError(_) => {
                Some(FailureKind::ConnectionError)
            }
            ProxyError::Reset(_) => Some(FailureKind::Reset),
            ProxyError::CircuitOpen { .. } => Some(FailureKind::GatewayError),
            ProxyError::UpstreamStatus(status) => {
                if matches!(status.as_u16(), 502 | 503 | 504) {
                    Some(FailureKind::GatewayError)
                } else if status.is_server_error() {
                    Some(FailureKind::ServerError)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Status code presented to the client once retries are exhausted.
    pub fn client_status(&self) -> StatusCode {
        match self {
            ProxyError::NoRouteMatched => StatusCode::NOT_FOUND,
            ProxyError::NoHealthyBackend { .. }
            | ProxyError::CircuitOpen { .. }
            | ProxyError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::ConnectionError(_) | ProxyError::TlsError(_) | ProxyError::Reset(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::UpstreamStatus(status) => {
                if status.is_server_error() {
                    StatusCode::BAD_GATEWAY
                } else {
                    *status
                }
            }
            // 499 is non-standard; the handler logs it and drops the response.
            ProxyError::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY),
            ProxyError::MiddlewareRejection { status, .. } => *status,
            ProxyError::MiddlewareFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable tag used in the JSON error body and metrics.
    pub fn tag(&self) -> &'static str {
        match self {
            ProxyError::NoRouteMatched => "no_route_matched",
            ProxyError::NoHealthyBackend { .. } => "no_healthy_backend",
            ProxyError::CircuitOpen { .. } => "circuit_open",
            ProxyError::Timeout { .. } => "timeout",
            ProxyError::ConnectionError(_) => "connection_error",
            ProxyError::TlsError(_) => "tls_error",
            ProxyError::Reset(_) => "reset",
            ProxyError::UpstreamStatus(_) => "upstream_status",
            ProxyError::Canceled => "canceled",
            ProxyError::Overloaded => "overloaded",
            ProxyError::MiddlewareRejection { .. } => "rejected",
            ProxyError::MiddlewareFailure { .. } => "middleware_failure",
        }
    }
}

/// Result alias used across the data plane.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_statuses_classify_as_gateway_error() {
        for code in [502u16, 503, 504] {
            let err = ProxyError::UpstreamStatus(StatusCode::from_u16(code).unwrap());
            assert_eq!(err.kind(), Some(FailureKind::GatewayError));
        }
        let err = ProxyError::UpstreamStatus(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.kind(), Some(FailureKind::ServerError));
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        let err = ProxyError::UpstreamStatus(StatusCode::NOT_FOUND);
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn test_exhausted_statuses() {
        assert_eq!(
            ProxyError::Timeout { elapsed_ms: 5000 }.client_status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::NoHealthyBackend {
                route_id: "echo".into()
            }
            .client_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::ConnectionError("refused".into()).client_status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
