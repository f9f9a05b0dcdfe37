//! Per-request context threaded through the middleware pipeline and the
//! retry loop.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::Instant,
};

use http::HeaderMap;
use tokio_util::sync::CancellationToken;

use crate::ports::auth::Identity;

/// Trace identifiers propagated to the upstream.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    /// Raw W3C `traceparent` when the client supplied one.
    pub traceparent: Option<String>,
}

/// Mutable request-scoped state.
///
/// Middlewares may attach loosely-typed values under a string key; typed
/// fields exist for the data the core itself consumes (identity for role
/// checks, trace ids for propagation, the cancellation token for upstream
/// I/O).
pub struct RequestContext {
    pub request_id: String,
    pub route_id: String,
    pub client_addr: Option<SocketAddr>,
    /// Scheme the client used on the first hop (`http` or `https`).
    pub scheme: &'static str,
    pub identity: Option<Identity>,
    pub trace: Option<TraceContext>,
    pub cancel: CancellationToken,
    pub started_at: Instant,
    /// Cookies parsed once from the inbound request.
    pub cookies: HashMap<String, String>,
    /// Middleware scratch space.
    pub values: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        route_id: String,
        client_addr: Option<SocketAddr>,
        scheme: &'static str,
        cookies: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request_id,
            route_id,
            client_addr,
            scheme,
            identity: None,
            trace: None,
            cancel,
            started_at: Instant::now(),
            cookies,
            values: HashMap::new(),
        }
    }

    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_addr.map(|addr| addr.ip())
    }
}

/// Parse the `Cookie` header(s) into a name -> value map. Later duplicates
/// win, matching browser submission order.
pub fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(http::header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.split_once('=') {
                cookies.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }
    cookies
}
