//! Proxy engine: the request-processing data plane.
//!
//! Aggregates the reference-swapped route snapshot with the runtime side
//! tables (backend health, circuit breakers) and drives the per-request
//! control flow: route match, middleware pre pass, retry loop around
//! (select backend, circuit gate, forward), middleware post pass.
//!
//! The engine deliberately owns no listener; the ingress adapter feeds it
//! requests and the config watcher task feeds it snapshots.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        Arc,
        Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use axum::body::Body;
use bytes::Bytes;
use hyper::{Request, Response};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    core::{
        circuit::CircuitRegistry,
        context::{RequestContext, parse_cookies},
        errors::{ProxyError, ProxyResult},
        forwarder::{Forwarder, RequestHead, status_is_circuit_success},
        health::{HealthProber, HealthRegistry},
        middleware::{MiddlewareDeps, error_response},
        pipeline::PrePassOutcome,
        retry,
        router,
        snapshot::{CompiledRoute, RouteSnapshot, compile_snapshot},
    },
    metrics,
    ports::{http_client::HttpClient, route_store::RouteStore},
};

fn default_session_cookie() -> String {
    "l8e-session".to_string()
}

fn default_max_in_flight() -> usize {
    8_192
}

fn default_pool_per_authority() -> usize {
    256
}

fn default_pool_wait_ms() -> u64 {
    1_000
}

fn default_body_buffer_bytes() -> usize {
    10 * 1024 * 1024
}

/// Tunables for the data plane, a subset of the application config.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Cookie consulted for sticky sessions unless the route overrides it.
    pub session_cookie: String,
    /// Process-wide in-flight request ceiling; excess is rejected with 503.
    pub max_in_flight: usize,
    /// Connection cap per backend authority.
    pub pool_per_authority: usize,
    /// Bounded wait for a pool slot before failing with a connection error.
    pub pool_wait_ms: u64,
    /// Cap on request bodies buffered for retryable attempts.
    pub body_buffer_bytes: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            session_cookie: default_session_cookie(),
            max_in_flight: default_max_in_flight(),
            pool_per_authority: default_pool_per_authority(),
            pool_wait_ms: default_pool_wait_ms(),
            body_buffer_bytes: default_body_buffer_bytes(),
        }
    }
}

pub struct ProxyEngine {
    snapshot: ArcSwap<RouteSnapshot>,
    health: Arc<HealthRegistry>,
    circuits: CircuitRegistry,
    prober: HealthProber,
    forwarder: Forwarder,
    deps: MiddlewareDeps,
    settings: EngineSettings,
    in_flight: Arc<tokio::sync::Semaphore>,
    ready: AtomicBool,
    shutdown: CancellationToken,
}

impl ProxyEngine {
    pub fn new(
        client: Arc<dyn HttpClient>,
        deps: MiddlewareDeps,
        settings: EngineSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let health = Arc::new(HealthRegistry::new());
        let in_flight = Arc::new(tokio::sync::Semaphore::new(settings.max_in_flight.max(1)));
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::empty()),
            health: health.clone(),
            circuits: CircuitRegistry::new(),
            prober: HealthProber::new(health, client.clone()),
            forwarder: Forwarder::new(
                client,
                settings.pool_per_authority,
                Duration::from_millis(settings.pool_wait_ms),
            ),
            deps,
            settings,
            in_flight,
            ready: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.snapshot.load_full()
    }

    pub fn health_registry(&self) -> &HealthRegistry {
        &self.health
    }

    /// Readiness: at least one snapshot has been published.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Compile and install a new route set, then reconcile probers,
    /// breakers and connection pools against it.
    pub async fn install(&self, version: u64, routes: &[crate::core::route::RouteSpec]) {
        match compile_snapshot(version, routes, &self.deps) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.prober.reconcile(&snapshot).await;
                self.circuits.reconcile(&snapshot).await;

                let authorities: HashSet<String> = snapshot
                    .backends()
                    .filter_map(|(_, b)| {
                        b.url
                            .parse::<http::Uri>()
                            .ok()
                            .and_then(|u| u.authority().map(|a| a.to_string()))
                    })
                    .collect();
                self.forwarder.retain_authorities(&authorities).await;

                metrics::set_routes_total(snapshot.route_count());
                self.snapshot.store(snapshot);
                self.ready.store(true, Ordering::Release);
                tracing::info!(version, "route snapshot installed");
            }
            Err(e) => {
                // The store validated the set before publishing; a compile
                // failure here indicates a bug, so keep serving the old
                // snapshot.
                tracing::error!(version, error = %e, "failed to compile published route set");
            }
        }
    }

    /// Long-lived task: prime from the store, then follow its watch
    /// channel. Restarts the subscription with backoff if the store side
    /// closes it.
    pub async fn run_config_watcher(self: Arc<Self>, store: Arc<dyn RouteStore>) {
        let initial = store.list().await;
        self.install(initial.version, &initial.routes).await;

        let mut backoff = Duration::from_millis(100);
        loop {
            let mut rx = store.watch();
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let set = rx.borrow_and_update().clone();
                        if set.version > self.snapshot().version {
                            self.install(set.version, &set.routes).await;
                        }
                        backoff = Duration::from_millis(100);
                    }
                }
            }
            tracing::warn!(
                backoff_ms = backoff.as_millis() as u64,
                "route store watch closed; resubscribing"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(Duration::from_secs(30));
        }
    }

    pub async fn shutdown_background(&self) {
        self.prober.shutdown().await;
    }

    /// Full data path for one request. Always yields a response; client
    /// cancellation is logged as 499 internally.
    pub async fn handle_request(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
        scheme: &'static str,
    ) -> Response<Body> {
        let request_id = req
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Process-level overload gate, ahead of routing.
        let permit = match self.in_flight.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(request_id = %request_id, "in-flight ceiling reached");
                return error_response(
                    http::StatusCode::SERVICE_UNAVAILABLE,
                    ProxyError::Overloaded.tag(),
                    &request_id,
                );
            }
        };
        metrics::set_active_connections(
            self.settings.max_in_flight - self.in_flight.available_permits(),
        );

        let span = crate::tracing_setup::create_request_span(
            req.method().as_str(),
            req.uri().path(),
            &request_id,
        );
        let response = tracing::Instrument::instrument(
            self.dispatch(req, client_addr, scheme, &request_id),
            span,
        )
        .await;
        drop(permit);
        metrics::set_active_connections(
            self.settings.max_in_flight - self.in_flight.available_permits(),
        );
        response
    }

    async fn dispatch(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
        scheme: &'static str,
        request_id: &str,
    ) -> Response<Body> {
        let snapshot = self.snapshot();
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        let Some(route) = router::match_route(
            &snapshot,
            &method,
            &path,
            req.headers(),
            query.as_deref(),
        ) else {
            tracing::debug!(request_id, method = %method, path = %path, "no route matched");
            metrics::record_request("", &method, 404, "");
            return error_response(
                http::StatusCode::NOT_FOUND,
                ProxyError::NoRouteMatched.tag(),
                request_id,
            );
        };

        let route_id = route.spec.id.clone();
        tracing::Span::current().record("route.id", route_id.as_str());

        let cancel = self.shutdown.child_token();
        let cookies = parse_cookies(req.headers());
        let mut ctx = RequestContext::new(
            request_id.to_string(),
            route_id.clone(),
            client_addr,
            scheme,
            cookies,
            cancel,
        );
        let mut timer = metrics::RequestTimer::new(&route_id);

        let mut req = req;
        let outcome = route.pipeline.run_pre(&mut ctx, &mut req).await;
        match outcome {
            PrePassOutcome::ShortCircuit { index, mut response } => {
                route.pipeline.run_post(&mut ctx, &mut response, index).await;
                metrics::record_request(&route_id, &method, response.status().as_u16(), "");
                return response;
            }
            PrePassOutcome::Fail { index, error } => {
                if let Some(response) = route.pipeline.run_error(&mut ctx, &error, index).await {
                    return response;
                }
                let status = error.client_status();
                metrics::record_request(&route_id, &method, status.as_u16(), "");
                return error_response(status, error.tag(), request_id);
            }
            PrePassOutcome::Continue => {}
        }

        let result = self.forward_with_retries(&route, &mut req, &ctx).await;
        let pipeline_len = route.pipeline.len();

        match result {
            Ok((mut response, backend)) => {
                route.pipeline.run_post_all(&mut ctx, &mut response).await;
                timer.set_backend(&backend);
                metrics::record_request(&route_id, &method, response.status().as_u16(), &backend);
                if let Some(len) = response
                    .headers()
                    .get(http::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    metrics::record_response_size(&route_id, len);
                }
                response
            }
            Err(ProxyError::Canceled) => {
                tracing::info!(request_id, route_id = %route_id, status = 499, "client canceled");
                metrics::record_request(&route_id, &method, 499, "");
                error_response(
                    ProxyError::Canceled.client_status(),
                    ProxyError::Canceled.tag(),
                    request_id,
                )
            }
            Err(error) => {
                if let Some(response) =
                    route.pipeline.run_error(&mut ctx, &error, pipeline_len).await
                {
                    return response;
                }
                let status = error.client_status();
                tracing::warn!(
                    request_id,
                    route_id = %route_id,
                    error = %error,
                    status = status.as_u16(),
                    "request failed"
                );
                metrics::record_request(&route_id, &method, status.as_u16(), "");
                error_response(status, error.tag(), request_id)
            }
        }
    }

    /// Retry envelope around (select backend -> circuit gate -> forward).
    /// Returns the response plus the backend that served it.
    async fn forward_with_retries(
        &self,
        route: &Arc<CompiledRoute>,
        req: &mut Request<Body>,
        ctx: &RequestContext,
    ) -> ProxyResult<(Response<Body>, String)> {
        let spec = &route.spec;
        let policy = &spec.retry_policy;
        let head = RequestHead::from_request(req);

        let retry_allowed = retry::method_allows_retry(&head.method, &head.headers, policy)
            && policy.max_retries > 0;

        // A retryable attempt needs a replayable body, so buffer it up to
        // the configured cap. Single-attempt requests stream straight
        // through and the body is taken exactly once.
        let body = std::mem::replace(req.body_mut(), Body::empty());
        let (buffered, single_body): (Option<Bytes>, StdMutex<Option<Body>>) = if retry_allowed {
            match axum::body::to_bytes(body, self.settings.body_buffer_bytes).await {
                Ok(bytes) => {
                    metrics::record_request_size(&spec.id, bytes.len() as u64);
                    (Some(bytes), StdMutex::new(None))
                }
                Err(e) => {
                    tracing::warn!(route_id = %spec.id, error = %e, "failed to buffer request body");
                    return Err(ProxyError::MiddlewareRejection {
                        status: http::StatusCode::PAYLOAD_TOO_LARGE,
                        message: "request body exceeds retry buffer".into(),
                    });
                }
            }
        } else {
            (None, StdMutex::new(Some(body)))
        };

        let sticky_value = if spec.sticky_session {
            let cookie_name = spec
                .session_cookie
                .as_deref()
                .unwrap_or(self.settings.session_cookie.as_str());
            ctx.cookies.get(cookie_name).cloned()
        } else {
            None
        };

        let deadline = request_deadline(&head.headers, policy, spec.timeout_ms);
        let attempt_timeout = Duration::from_millis(spec.timeout_ms);
        let tried: StdMutex<HashSet<String>> = StdMutex::new(HashSet::new());
        let served_by: StdMutex<String> = StdMutex::new(String::new());

        let head_ref = &head;
        let ctx_ref = ctx;
        let route_ref = route;
        let tried_ref = &tried;
        let served_ref = &served_by;
        let sticky_ref = sticky_value.as_deref();
        let buffered_ref = &buffered;
        let single_body_ref = &single_body;

        let result = retry::execute(
            &spec.id,
            policy,
            retry_allowed,
            deadline,
            move |attempt_n| async move {
                let attempt_body = match buffered_ref {
                    Some(bytes) => Body::from(bytes.clone()),
                    None => single_body_ref
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .take()
                        .unwrap_or_else(Body::empty),
                };
                self.attempt_once(
                    route_ref,
                    head_ref,
                    attempt_body,
                    ctx_ref,
                    attempt_timeout,
                    attempt_n,
                    retry_allowed,
                    sticky_ref,
                    tried_ref,
                    served_ref,
                )
                .await
            },
        )
        .await;

        let backend = served_by
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        result.map(|response| (response, backend))
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_once(
        &self,
        route: &Arc<CompiledRoute>,
        head: &RequestHead,
        body: Body,
        ctx: &RequestContext,
        attempt_timeout: Duration,
        attempt_n: u32,
        retry_allowed: bool,
        sticky_value: Option<&str>,
        tried: &StdMutex<HashSet<String>>,
        served_by: &StdMutex<String>,
    ) -> ProxyResult<Response<Body>> {
        let spec = &route.spec;
        let exclude = tried.lock().unwrap_or_else(|p| p.into_inner()).clone();

        let choice =
            crate::core::selector::select_backend(route, &self.health, sticky_value, &exclude)
                .await?;
        let backend_url = choice.backend.url.clone();
        tried
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(backend_url.clone());
        *served_by.lock().unwrap_or_else(|p| p.into_inner()) = backend_url.clone();

        let breaker = self
            .circuits
            .get_or_insert(&spec.id, &backend_url, &spec.circuit_breaker)
            .await;
        let permit = breaker.try_acquire()?;

        tracing::debug!(
            route_id = %spec.id,
            backend = %backend_url,
            attempt = attempt_n,
            "forwarding attempt"
        );

        choice.health.begin_request();
        let outcome = self
            .forwarder
            .forward(head, body, spec, &choice.backend, ctx, attempt_timeout)
            .await;
        choice.health.end_request();

        match outcome {
            Ok(response) => {
                let status = response.status();
                breaker.record(permit, status_is_circuit_success(status));

                // A 5xx the policy names becomes an error so the retry
                // engine can act on it; when retries are off for this
                // request the status streams back untouched.
                if retry_allowed && status.is_server_error() {
                    let as_error = ProxyError::UpstreamStatus(status);
                    if retry::is_retryable(&spec.retry_policy, &as_error) {
                        return Err(as_error);
                    }
                }
                Ok(response)
            }
            Err(error) => {
                match &error {
                    ProxyError::Timeout { .. }
                    | ProxyError::ConnectionError(_)
                    | ProxyError::TlsError(_)
                    | ProxyError::Reset(_) => breaker.record(permit, false),
                    // Says nothing about the backend.
                    _ => breaker.release(permit),
                }
                Err(error)
            }
        }
    }
}

/// Total request budget: client-supplied `X-Request-Timeout-Ms`, or the
/// policy-derived worst case.
fn request_deadline(
    headers: &http::HeaderMap,
    policy: &crate::core::route::RetryPolicy,
    timeout_ms: u64,
) -> tokio::time::Instant {
    let budget = headers
        .get("x-request-timeout-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| retry::default_total_budget(policy, timeout_ms));
    tokio::time::Instant::now() + budget
}

