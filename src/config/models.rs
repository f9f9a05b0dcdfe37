//! Application configuration for l8e-harbor.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files.
//! They are intentionally serde-friendly and include defaults so that
//! minimal configs remain concise. Route definitions are NOT part of this
//! file; they live in the route store selected here.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::engine::EngineSettings;

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_route_store_path() -> String {
    "/var/lib/l8e-harbor/routes.yaml".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_json() -> bool {
    true
}

/// Which route store driver backs the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouteStoreKind {
    #[default]
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteStoreConfig {
    pub kind: RouteStoreKind,
    /// Snapshot file (file driver) or database path (sqlite driver).
    pub path: String,
    /// Periodic flush interval for the file driver.
    pub flush_interval_secs: u64,
}

impl Default for RouteStoreConfig {
    fn default() -> Self {
        Self {
            kind: RouteStoreKind::Memory,
            path: default_route_store_path(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

/// Ingress TLS. Minimum version is 1.2; client CA enables mutual TLS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    #[serde(default)]
    pub client_ca_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// JSON lines when true, human-readable otherwise.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_log_json(),
        }
    }
}

/// A static auth token entry consumed by the local auth adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokenEntry {
    pub token: String,
    pub subject: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarborConfig {
    pub listen_addr: String,
    pub tls: Option<TlsConfig>,
    pub route_store: RouteStoreConfig,
    pub logging: LoggingConfig,
    /// Data-plane tunables (session cookie, in-flight ceiling, pool caps).
    pub proxy: EngineSettings,
    /// Tokens for the built-in static auth adapter; empty means the `auth`
    /// middleware rejects everything.
    pub auth_tokens: Vec<AuthTokenEntry>,
}

impl Default for HarborConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tls: None,
            route_store: RouteStoreConfig::default(),
            logging: LoggingConfig::default(),
            proxy: EngineSettings::default(),
            auth_tokens: Vec::new(),
        }
    }
}

impl HarborConfig {
    /// Startup validation; failures here exit the process with code 1.
    pub fn validate(&self) -> Result<(), String> {
        self.listen_addr.parse::<SocketAddr>().map_err(|_| {
            format!(
                "invalid listen_addr '{}': expected IP:PORT",
                self.listen_addr
            )
        })?;

        if let Some(tls) = &self.tls {
            if tls.cert_path.is_empty() || tls.key_path.is_empty() {
                return Err("tls.cert_path and tls.key_path are required when tls is set".into());
            }
        }

        if self.proxy.max_in_flight == 0 {
            return Err("proxy.max_in_flight must be greater than 0".into());
        }
        if self.proxy.pool_per_authority == 0 {
            return Err("proxy.pool_per_authority must be greater than 0".into());
        }
        Ok(())
    }
}
