//! SQLite route store.
//!
//! Durability lives in a single `routes` table (`id` primary key, the
//! canonical JSON serialization in a BLOB column, and an integer `version`
//! column shared by every row of a commit). Reads run in WAL mode. The
//! watch channel and the in-process cache reuse the memory store; SQLite is
//! consulted only at startup and on commit.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::watch;

use crate::{
    adapters::route_stores::memory::MemoryRouteStore,
    core::{route::RouteSpec, snapshot::validate_route_set},
    ports::route_store::{RouteSet, RouteStore, RouteStoreError},
};

pub struct SqliteRouteStore {
    inner: Arc<MemoryRouteStore>,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRouteStore {
    /// Open (creating if needed) the database and load the stored set.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RouteStoreError> {
        let path: PathBuf = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RouteStoreError::Backend(format!("create {parent:?}: {e}")))?;
        }

        let (conn, routes, version) = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .map_err(|e| RouteStoreError::Backend(format!("open {}: {e}", path.display())))?;
            // journal_mode returns the resulting mode as a row.
            let _mode: String = conn
                .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
                .map_err(|e| RouteStoreError::Backend(format!("enable WAL: {e}")))?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS routes (
                    id TEXT PRIMARY KEY,
                    spec BLOB NOT NULL,
                    version INTEGER NOT NULL
                )",
                [],
            )
            .map_err(|e| RouteStoreError::Backend(format!("create table: {e}")))?;

            let mut stmt = conn
                .prepare("SELECT spec, version FROM routes ORDER BY id")
                .map_err(|e| RouteStoreError::Backend(e.to_string()))?;
            let mut rows = stmt
                .query([])
                .map_err(|e| RouteStoreError::Backend(e.to_string()))?;

            let mut routes = Vec::new();
            let mut version: u64 = 0;
            while let Some(row) = rows
                .next()
                .map_err(|e| RouteStoreError::Backend(e.to_string()))?
            {
                let blob: Vec<u8> = row
                    .get(0)
                    .map_err(|e| RouteStoreError::Backend(e.to_string()))?;
                let row_version: i64 = row
                    .get(1)
                    .map_err(|e| RouteStoreError::Backend(e.to_string()))?;
                version = version.max(row_version.max(0) as u64);
                match serde_json::from_slice::<RouteSpec>(&blob) {
                    Ok(route) => routes.push(route),
                    Err(e) => {
                        tracing::error!(error = %e, "skipping undecodable route row");
                    }
                }
            }
            drop(rows);
            drop(stmt);
            Ok::<_, RouteStoreError>((conn, routes, version))
        })
        .await
        .map_err(|e| RouteStoreError::Backend(format!("join error: {e}")))??;

        let inner = if routes.is_empty() {
            MemoryRouteStore::new()
        } else if let Err(e) = validate_route_set(&routes) {
            tracing::error!(error = %e, "stored route set invalid; starting empty");
            MemoryRouteStore::new()
        } else {
            tracing::info!(version, routes = routes.len(), "loaded routes from sqlite");
            MemoryRouteStore::with_initial(routes, version.max(1))
        };

        Ok(Self {
            inner: Arc::new(inner),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn persist(&self, routes: &[RouteSpec], version: u64) -> Result<(), RouteStoreError> {
        let serialized: Vec<(String, Vec<u8>)> = routes
            .iter()
            .map(|route| {
                serde_json::to_vec(route)
                    .map(|blob| (route.id.clone(), blob))
                    .map_err(|e| RouteStoreError::Backend(format!("serialize '{}': {e}", route.id)))
            })
            .collect::<Result<_, _>>()?;

        let mut conn = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx = conn
            .transaction()
            .map_err(|e| RouteStoreError::Backend(e.to_string()))?;
        tx.execute("DELETE FROM routes", [])
            .map_err(|e| RouteStoreError::Backend(e.to_string()))?;
        for (id, blob) in serialized {
            tx.execute(
                "INSERT INTO routes (id, spec, version) VALUES (?1, ?2, ?3)",
                rusqlite::params![id, blob, version as i64],
            )
            .map_err(|e| RouteStoreError::Backend(e.to_string()))?;
        }
        tx.commit()
            .map_err(|e| RouteStoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl RouteStore for SqliteRouteStore {
    async fn list(&self) -> RouteSet {
        self.inner.list().await
    }

    fn watch(&self) -> watch::Receiver<RouteSet> {
        self.inner.watch()
    }

    async fn apply(&self, routes: Vec<RouteSpec>) -> Result<u64, RouteStoreError> {
        let version = self.inner.apply(routes.clone()).await?;
        let this = Self {
            inner: self.inner.clone(),
            conn: self.conn.clone(),
        };
        tokio::task::spawn_blocking(move || this.persist(&routes, version))
            .await
            .map_err(|e| RouteStoreError::Backend(format!("join error: {e}")))??;
        Ok(version)
    }
}
