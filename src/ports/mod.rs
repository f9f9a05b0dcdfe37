pub mod auth;
pub mod http_client;
pub mod route_store;
pub mod secrets;

pub use auth::{AuthAdapter, AuthError, Identity};
pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
pub use route_store::{RouteSet, RouteStore, RouteStoreError};
pub use secrets::{SecretError, SecretProvider};
