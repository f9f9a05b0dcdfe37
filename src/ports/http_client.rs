use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use http::StatusCode;
use hyper::{Request, Response};
use thiserror::Error;

/// Transport-level failures surfaced by an HTTP client implementation.
///
/// The forwarder maps these onto the data-plane error taxonomy; keeping the
/// distinction here lets retry policies tell a refused connect from a reset
/// stream or a TLS negotiation failure.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// DNS resolution or TCP connect failed.
    #[error("connect error: {0}")]
    Connect(String),

    /// TLS handshake with the upstream failed.
    #[error("tls error: {0}")]
    Tls(String),

    /// The upstream closed or reset the connection mid-exchange.
    #[error("connection reset: {0}")]
    Reset(String),

    /// No response headers within the allotted budget.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// The request could not be constructed or sent as given.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations.
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Per-request transport options the forwarder attaches as a request
/// extension; implementations honoring TLS opt-outs consult it.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamTlsOptions {
    pub verify: bool,
}

/// Port for issuing HTTP requests to upstream backends.
///
/// One implementation backs both real traffic and health probes so that
/// connection pools are shared per backend authority.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a request and stream back the response. Timeout enforcement is
    /// the caller's responsibility (the forwarder owns the attempt budget).
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>>;

    /// Issue a single health probe with its own timeout, returning the
    /// response status. Probe bodies are drained and discarded.
    async fn probe(&self, req: Request<Body>, timeout: Duration) -> HttpClientResult<StatusCode>;
}
