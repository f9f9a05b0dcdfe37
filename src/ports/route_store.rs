use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::core::{route::RouteSpec, snapshot::RouteSetError};

/// A published, immutable set of routes plus its version token.
///
/// Versions are monotonic per store instance; readers hold an `Arc` to the
/// set for the life of a request so an in-flight request never observes a
/// partially applied change.
#[derive(Debug, Clone)]
pub struct RouteSet {
    pub version: u64,
    pub routes: Arc<Vec<RouteSpec>>,
}

impl RouteSet {
    pub fn empty() -> Self {
        Self {
            version: 0,
            routes: Arc::new(Vec::new()),
        }
    }
}

/// Route store failures.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RouteStoreError {
    /// The proposed set violates route invariants; nothing was applied.
    #[error("invalid route set: {0}")]
    InvalidRouteSet(#[from] RouteSetError),

    /// Backing storage failed (file I/O, database).
    #[error("route store backend error: {0}")]
    Backend(String),
}

/// Port over the authoritative route set.
///
/// Implementations must serialize `apply` (at most one in flight), validate
/// the whole resulting set before the swap, and publish every commit over
/// the watch channel. `watch` receivers coalesce: a slow consumer observes
/// only the latest set, and no consumer ever blocks a writer.
#[async_trait]
pub trait RouteStore: Send + Sync + 'static {
    /// Current snapshot and its version token.
    async fn list(&self) -> RouteSet;

    /// Subscribe to snapshot updates. The receiver is primed with the
    /// current set.
    fn watch(&self) -> watch::Receiver<RouteSet>;

    /// Replace the whole route set after validating it, returning the new
    /// version. Applying an identical set still bumps the version (the
    /// store does not diff), but implementations may short-circuit.
    async fn apply(&self, routes: Vec<RouteSpec>) -> Result<u64, RouteStoreError>;
}
