pub mod circuit;
pub mod context;
pub mod errors;
pub mod forwarder;
pub mod health;
pub mod middleware;
pub mod pipeline;
pub mod retry;
pub mod route;
pub mod router;
pub mod selector;
pub mod snapshot;

pub use circuit::{CircuitBreaker, CircuitRegistry, CircuitState};
pub use context::RequestContext;
pub use errors::{FailureKind, ProxyError, ProxyResult};
pub use forwarder::Forwarder;
pub use health::{BackendHealth, HealthProber, HealthRegistry, HealthState};
pub use pipeline::{Middleware, Pipeline, PreVerdict};
pub use route::{BackendSpec, RouteDocument, RouteSpec};
pub use snapshot::{RouteSnapshot, compile_snapshot, validate_route_set};
