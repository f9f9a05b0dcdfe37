//! l8e-harbor - An AI-oriented reverse proxy and API gateway.
//!
//! l8e-harbor terminates client HTTP(S) requests, matches them against
//! declarative route definitions, runs an ordered middleware chain, selects
//! a healthy backend by weight, and forwards the request under a retry +
//! circuit-breaker envelope while emitting structured logs and metrics.
//! The crate follows a **hexagonal architecture**: business logic lives in
//! `core`, trait seams in `ports`, concrete implementations in `adapters`.
//! This library exposes the building blocks so you can embed the data
//! plane or compose parts of it inside your own application.
//!
//! # Features
//! - Declarative routes with priority dispatch, header/query matchers and
//!   per-route middleware chains (auth, CORS, header rewrite, rate limit,
//!   logging, tracing, security headers)
//! - Versioned, atomically-swapped route snapshots with watch semantics;
//!   in-memory, file-snapshot and SQLite store drivers
//! - Weighted load balancing with sticky sessions and active health probing
//! - Per-(route, backend) circuit breakers and bounded exponential retry
//!   with jitter and idempotency guards
//! - Streaming HTTP/1.1 + HTTP/2 forwarding over rustls with per-attempt
//!   timeouts and hop-by-hop header hygiene
//! - Structured JSON logging via `tracing` and a stable `l8e_*` metric set
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use l8e_harbor::{
//!     adapters::{DenyAllAuth, HttpClientAdapter, MemoryRouteStore},
//!     core::middleware::MiddlewareDeps,
//!     engine::{EngineSettings, ProxyEngine},
//!     ports::route_store::RouteStore,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let store = Arc::new(MemoryRouteStore::new());
//! store
//!     .apply(vec![l8e_harbor::core::route::RouteSpec::new(
//!         "echo", "/echo", "http://127.0.0.1:9000",
//!     )])
//!     .await?;
//!
//! let engine = Arc::new(ProxyEngine::new(
//!     Arc::new(HttpClientAdapter::new()?),
//!     MiddlewareDeps { auth: Arc::new(DenyAllAuth) },
//!     EngineSettings::default(),
//!     CancellationToken::new(),
//! ));
//! tokio::spawn(engine.clone().run_config_watcher(store));
//! // Wire `engine` into the provided HttpHandler adapter (see binary crate).
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Data-plane faults are typed (`ProxyError`) and map onto client statuses
//! per the gateway contract; adapter and startup paths return
//! `eyre::Result` with context attached via `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Route snapshots are reference-swapped (`arc-swap`); shared registries
//! use `scc::HashMap`; circuit transitions serialize on a per-breaker
//! mutex held only for counter updates.
//!
//! # License
//! Dual-licensed under either MIT or Apache-2.0 at your option.

pub mod config;
pub mod engine;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// Implementation detail modules, re-exported for embedders and tests.
pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HttpClientAdapter, HttpHandler},
    engine::{EngineSettings, ProxyEngine},
    ports::{auth::AuthAdapter, http_client::HttpClient, route_store::RouteStore},
    utils::GracefulShutdown,
};
