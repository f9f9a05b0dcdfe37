pub mod auth;
pub mod http_client;
pub mod http_handler;
pub mod route_stores;
pub mod secrets;

pub use auth::{DenyAllAuth, StaticTokenAuth};
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use route_stores::{FileRouteStore, MemoryRouteStore, SqliteRouteStore};
pub use secrets::LocalFsSecrets;
