//! File-snapshot route store.
//!
//! Memory-store semantics plus durability: every commit rewrites a YAML
//! snapshot document at the configured path (atomically, via a temp file
//! rename), and a background task flushes on an interval as a belt against
//! missed writes. On startup the newest valid file is loaded; a corrupt
//! file logs an error and the store starts empty rather than refusing to
//! boot.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    adapters::route_stores::memory::MemoryRouteStore,
    core::{route::RouteSpec, snapshot::validate_route_set},
    ports::route_store::{RouteSet, RouteStore, RouteStoreError},
};

/// On-disk document shape.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u64,
    saved_at: DateTime<Utc>,
    routes: Vec<RouteSpec>,
}

pub struct FileRouteStore {
    inner: Arc<MemoryRouteStore>,
    path: PathBuf,
}

impl FileRouteStore {
    /// Open the store, loading an existing snapshot file when present.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RouteStoreError> {
        let path: PathBuf = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RouteStoreError::Backend(format!("create {parent:?}: {e}")))?;
        }

        let inner = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_yaml::from_str::<SnapshotFile>(&contents) {
                Ok(snapshot) => {
                    if let Err(e) = validate_route_set(&snapshot.routes) {
                        tracing::error!(path = %path.display(), error = %e, "snapshot file invalid; starting empty");
                        MemoryRouteStore::new()
                    } else {
                        tracing::info!(
                            path = %path.display(),
                            version = snapshot.version,
                            routes = snapshot.routes.len(),
                            "loaded route snapshot"
                        );
                        MemoryRouteStore::with_initial(snapshot.routes, snapshot.version.max(1))
                    }
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "snapshot file unparsable; starting empty");
                    MemoryRouteStore::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryRouteStore::new(),
            Err(e) => {
                return Err(RouteStoreError::Backend(format!(
                    "read {}: {e}",
                    path.display()
                )));
            }
        };

        Ok(Self {
            inner: Arc::new(inner),
            path,
        })
    }

    /// Spawn the periodic flush task. Returns its handle so the caller can
    /// abort it on shutdown.
    pub fn spawn_flush_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        let path = self.path.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let set = inner.list().await;
                if let Err(e) = persist(&path, &set).await {
                    tracing::error!(path = %path.display(), error = %e, "periodic snapshot flush failed");
                }
            }
        })
    }

    async fn persist_current(&self) -> Result<(), RouteStoreError> {
        let set = self.inner.list().await;
        persist(&self.path, &set).await
    }
}

async fn persist(path: &PathBuf, set: &RouteSet) -> Result<(), RouteStoreError> {
    let document = SnapshotFile {
        version: set.version,
        saved_at: Utc::now(),
        routes: set.routes.as_ref().clone(),
    };
    let yaml = serde_yaml::to_string(&document)
        .map_err(|e| RouteStoreError::Backend(format!("serialize snapshot: {e}")))?;

    let tmp = path.with_extension("yaml.tmp");
    tokio::fs::write(&tmp, yaml)
        .await
        .map_err(|e| RouteStoreError::Backend(format!("write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| RouteStoreError::Backend(format!("rename {}: {e}", path.display())))?;
    Ok(())
}

#[async_trait]
impl RouteStore for FileRouteStore {
    async fn list(&self) -> RouteSet {
        self.inner.list().await
    }

    fn watch(&self) -> watch::Receiver<RouteSet> {
        self.inner.watch()
    }

    async fn apply(&self, routes: Vec<RouteSpec>) -> Result<u64, RouteStoreError> {
        let version = self.inner.apply(routes).await?;
        self.persist_current().await?;
        Ok(version)
    }
}
