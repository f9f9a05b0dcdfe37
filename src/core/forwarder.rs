//! Upstream HTTP forwarding for one attempt.
//!
//! The forwarder clones the inbound request head minus hop-by-hop headers,
//! rewrites the path per route (`strip_prefix` / `add_prefix`), appends the
//! standard forwarding headers, enforces the per-attempt timeout up to the
//! first response byte, and wraps the response body with an idle timeout
//! between chunks. Bodies stream in both directions; nothing here buffers.

use std::{sync::Arc, time::Duration};

use axum::body::Body;
use bytes::Bytes;
use futures_util::StreamExt;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, Uri, Version,
    header::{self, HOST},
};
use hyper::{Request, Response};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        context::RequestContext,
        errors::{ProxyError, ProxyResult},
        route::{BackendSpec, RouteSpec},
    },
    ports::http_client::{HttpClient, HttpClientError},
};

/// Hop-by-hop headers never forwarded upstream.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Immutable copy of the inbound request line + headers, cheap to clone per
/// attempt while the body travels separately.
#[derive(Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub version: Version,
}

impl RequestHead {
    pub fn from_request(req: &Request<Body>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
            version: req.version(),
        }
    }
}

pub struct Forwarder {
    client: Arc<dyn HttpClient>,
    per_authority_cap: usize,
    pool_wait: Duration,
    permits: scc::HashMap<String, Arc<Semaphore>>,
}

impl Forwarder {
    pub fn new(client: Arc<dyn HttpClient>, per_authority_cap: usize, pool_wait: Duration) -> Self {
        Self {
            client,
            per_authority_cap: per_authority_cap.max(1),
            pool_wait,
            permits: scc::HashMap::new(),
        }
    }

    /// Perform one upstream attempt against `backend`.
    ///
    /// `attempt_timeout` covers time-to-first-response-byte; once headers
    /// arrive a separate idle timeout (same duration) applies between body
    /// chunks. Cancellation aborts the attempt promptly and surfaces
    /// [`ProxyError::Canceled`].
    pub async fn forward(
        &self,
        head: &RequestHead,
        body: Body,
        route: &RouteSpec,
        backend: &BackendSpec,
        ctx: &RequestContext,
        attempt_timeout: Duration,
    ) -> ProxyResult<Response<Body>> {
        let upstream_uri = build_upstream_uri(&backend.url, route, &head.uri)?;
        let authority = upstream_uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| backend.url.clone());

        let mut request = Request::builder()
            .method(head.method.clone())
            .uri(upstream_uri)
            .version(Version::HTTP_11)
            .body(body)
            .map_err(|e| ProxyError::ConnectionError(format!("failed to build request: {e}")))?;

        *request.headers_mut() = prepare_headers(&head.headers, &authority, ctx);
        if let Some(tls) = &backend.tls {
            request
                .extensions_mut()
                .insert(crate::ports::http_client::UpstreamTlsOptions {
                    verify: tls.verify.unwrap_or(true),
                });
        }

        // Per-authority connection cap with a bounded wait.
        let semaphore = self.authority_semaphore(&authority).await;
        let permit = match tokio::time::timeout(self.pool_wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ProxyError::ConnectionError(
                    "connection pool closed".to_string(),
                ));
            }
            Err(_) => {
                return Err(ProxyError::ConnectionError(format!(
                    "connection pool for {authority} saturated"
                )));
            }
        };

        let send = self.client.send_request(request);
        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ProxyError::Canceled),
            result = tokio::time::timeout(attempt_timeout, send) => match result {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(error)) => Err(map_client_error(error)),
                Err(_) => Err(ProxyError::Timeout {
                    elapsed_ms: attempt_timeout.as_millis() as u64,
                }),
            },
        };
        drop(permit);

        let response = outcome?;
        let (mut parts, body) = response.into_parts();
        // Framing is re-established hop by hop.
        parts.headers.remove(header::TRANSFER_ENCODING);
        let body = idle_timeout_body(body, attempt_timeout, ctx.cancel.clone());
        Ok(Response::from_parts(parts, body))
    }

    async fn authority_semaphore(&self, authority: &str) -> Arc<Semaphore> {
        if let Some(entry) = self.permits.get_async(authority).await {
            return entry.get().clone();
        }
        let semaphore = Arc::new(Semaphore::new(self.per_authority_cap));
        match self
            .permits
            .insert_async(authority.to_string(), semaphore.clone())
            .await
        {
            Ok(()) => semaphore,
            Err(_) => self
                .permits
                .get_async(authority)
                .await
                .map(|entry| entry.get().clone())
                .unwrap_or(semaphore),
        }
    }

    /// Drop pool gates for authorities no longer referenced by any
    /// snapshot backend.
    pub async fn retain_authorities(&self, live: &std::collections::HashSet<String>) {
        self.permits
            .retain_async(|authority, _| live.contains(authority))
            .await;
    }
}

/// Rewrite the inbound path per route and splice it onto the backend URL.
pub fn build_upstream_uri(backend_url: &str, route: &RouteSpec, inbound: &Uri) -> ProxyResult<Uri> {
    let mut path = inbound.path().to_string();
    if route.strip_prefix {
        path = path
            .strip_prefix(route.path.as_str())
            .map(str::to_string)
            .unwrap_or(path);
        if path.is_empty() {
            path = "/".to_string();
        }
    }
    if let Some(prefix) = &route.add_prefix {
        path = format!("{}{}", prefix.trim_end_matches('/'), path);
    }
    if !path.starts_with('/') {
        path = format!("/{path}");
    }

    let base = backend_url.trim_end_matches('/');
    let uri = match inbound.query() {
        Some(query) => format!("{base}{path}?{query}"),
        None => format!("{base}{path}"),
    };
    uri.parse::<Uri>()
        .map_err(|e| ProxyError::ConnectionError(format!("invalid upstream uri '{uri}': {e}")))
}

/// Copy inbound headers minus hop-by-hop ones, then apply Host and the
/// X-Forwarded-* / trace conventions.
fn prepare_headers(inbound: &HeaderMap, authority: &str, ctx: &RequestContext) -> HeaderMap {
    let mut headers = inbound.clone();

    // Headers named by the Connection header are hop-by-hop too.
    let connection_named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| name.trim().parse::<HeaderName>().ok())
        .collect();
    for name in connection_named {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }

    if let Ok(value) = HeaderValue::from_str(authority) {
        headers.insert(HOST, value);
    }

    // X-Forwarded-For: append the client IP to any existing chain.
    if let Some(ip) = ctx.client_ip() {
        let chain = match headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) if !existing.is_empty() => format!("{existing}, {ip}"),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert("x-forwarded-for", value);
        }
    }

    // First-hop values only; never overwrite an existing chain.
    if !headers.contains_key("x-forwarded-proto") {
        headers.insert("x-forwarded-proto", HeaderValue::from_static(ctx.scheme));
    }
    if !headers.contains_key("x-forwarded-host") {
        if let Some(value) = inbound.get(HOST).cloned() {
            headers.insert("x-forwarded-host", value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert("x-request-id", value);
    }

    if let Some(trace) = &ctx.trace {
        let traceparent = format!("00-{}-{}-01", trace.trace_id, trace.span_id);
        if let Ok(value) = HeaderValue::from_str(&traceparent) {
            headers.insert("traceparent", value);
        }
        if let Ok(value) = HeaderValue::from_str(&trace.trace_id) {
            headers.insert("x-trace-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&trace.span_id) {
            headers.insert("x-span-id", value);
        }
    }

    headers
}

fn map_client_error(error: HttpClientError) -> ProxyError {
    match error {
        HttpClientError::Connect(message) => ProxyError::ConnectionError(message),
        HttpClientError::Tls(message) => ProxyError::TlsError(message),
        HttpClientError::Reset(message) => ProxyError::Reset(message),
        HttpClientError::Timeout(ms) => ProxyError::Timeout { elapsed_ms: ms },
        HttpClientError::InvalidRequest(message) => ProxyError::ConnectionError(message),
    }
}

/// Wrap a streaming body so that a stall between chunks longer than `idle`
/// tears the stream down, and client cancellation stops reads promptly.
fn idle_timeout_body(body: Body, idle: Duration, cancel: CancellationToken) -> Body {
    let stream = body.into_data_stream();
    let stream = tokio_stream::StreamExt::timeout(stream, idle);
    let guarded = stream.map(move |item| match item {
        Ok(Ok(bytes)) => Ok::<Bytes, std::io::Error>(bytes),
        Ok(Err(e)) => Err(std::io::Error::other(e)),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "idle timeout between body chunks",
        )),
    });
    let cancelable = futures_util::stream::unfold(
        (Box::pin(guarded), cancel),
        |(mut stream, cancel)| async move {
            if cancel.is_cancelled() {
                return None;
            }
            tokio::select! {
                _ = cancel.cancelled() => None,
                next = stream.next() => next.map(|item| (item, (stream, cancel))),
            }
        },
    );
    Body::from_stream(cancelable)
}

/// Circuit-breaker success classifier for responses: 4xx are client
/// errors, not backend faults, except 408.
pub fn status_is_circuit_success(status: http::StatusCode) -> bool {
    !(status.is_server_error() || status == http::StatusCode::REQUEST_TIMEOUT)
}
