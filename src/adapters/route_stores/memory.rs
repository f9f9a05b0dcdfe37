//! In-memory route store.
//!
//! The authoritative set lives inside a `tokio::sync::watch` channel, which
//! gives readers a consistent `Arc` snapshot and watchers natural
//! coalescing: slow consumers observe only the latest published set and
//! never block a writer. `apply` is serialized by a mutex.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use crate::{
    core::{route::RouteSpec, snapshot::validate_route_set},
    ports::route_store::{RouteSet, RouteStore, RouteStoreError},
};

pub struct MemoryRouteStore {
    current: watch::Sender<RouteSet>,
    version: AtomicU64,
    apply_lock: Mutex<()>,
}

impl MemoryRouteStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RouteSet::empty());
        Self {
            current: tx,
            version: AtomicU64::new(0),
            apply_lock: Mutex::new(()),
        }
    }

    /// Seed the store with a pre-validated set at version 1 (used by the
    /// persistent drivers on startup).
    pub fn with_initial(routes: Vec<RouteSpec>, version: u64) -> Self {
        let store = Self::new();
        store.version.store(version, Ordering::SeqCst);
        store.current.send_replace(RouteSet {
            version,
            routes: std::sync::Arc::new(routes),
        });
        store
    }
}

impl Default for MemoryRouteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteStore for MemoryRouteStore {
    async fn list(&self) -> RouteSet {
        self.current.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<RouteSet> {
        self.current.subscribe()
    }

    async fn apply(&self, routes: Vec<RouteSpec>) -> Result<u64, RouteStoreError> {
        let _guard = self.apply_lock.lock().await;

        validate_route_set(&routes)?;

        // Re-applying the identical set is a no-op; no version bump, no
        // watch event.
        let unchanged = {
            let current = self.current.borrow();
            *current.routes == routes
        };
        if unchanged {
            return Ok(self.version.load(Ordering::SeqCst));
        }

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.current.send_replace(RouteSet {
            version,
            routes: std::sync::Arc::new(routes),
        });
        tracing::info!(version, "route set applied");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_bumps_version_and_publishes() {
        let store = MemoryRouteStore::new();
        let mut rx = store.watch();

        let v1 = store
            .apply(vec![RouteSpec::new("a", "/a", "http://b:1")])
            .await
            .unwrap();
        assert_eq!(v1, 1);

        rx.changed().await.unwrap();
        let set = rx.borrow_and_update().clone();
        assert_eq!(set.version, 1);
        assert_eq!(set.routes.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_set_rejected_and_not_published() {
        let store = MemoryRouteStore::new();
        store
            .apply(vec![RouteSpec::new("a", "/a", "http://b:1")])
            .await
            .unwrap();

        let err = store
            .apply(vec![RouteSpec::new("BAD ID", "/a", "http://b:1")])
            .await
            .unwrap_err();
        assert!(matches!(err, RouteStoreError::InvalidRouteSet(_)));

        // Previous snapshot still current.
        let set = store.list().await;
        assert_eq!(set.version, 1);
        assert_eq!(set.routes[0].id, "a");
    }

    #[tokio::test]
    async fn test_reapplying_identical_set_is_noop() {
        let store = MemoryRouteStore::new();
        let routes = vec![RouteSpec::new("a", "/a", "http://b:1")];
        let v1 = store.apply(routes.clone()).await.unwrap();
        let v2 = store.apply(routes).await.unwrap();
        assert_eq!(v1, v2);
    }

    #[tokio::test]
    async fn test_slow_watcher_coalesces_to_latest() {
        let store = MemoryRouteStore::new();
        let mut rx = store.watch();

        for i in 0..5 {
            store
                .apply(vec![RouteSpec::new(
                    format!("r{i}"),
                    "/a",
                    "http://b:1",
                )])
                .await
                .unwrap();
        }

        rx.changed().await.unwrap();
        let set = rx.borrow_and_update().clone();
        assert_eq!(set.version, 5);
        assert_eq!(set.routes[0].id, "r4");
        // No backlog: nothing further is pending.
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_readers_hold_consistent_snapshot() {
        let store = MemoryRouteStore::new();
        store
            .apply(vec![RouteSpec::new("a", "/a", "http://b:1")])
            .await
            .unwrap();
        let held = store.list().await;

        store
            .apply(vec![RouteSpec::new("b", "/b", "http://b:2")])
            .await
            .unwrap();

        // The held snapshot is immutable even after a new publish.
        assert_eq!(held.version, 1);
        assert_eq!(held.routes[0].id, "a");
        assert_eq!(store.list().await.version, 2);
    }
}
