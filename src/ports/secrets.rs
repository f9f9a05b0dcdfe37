use async_trait::async_trait;
use thiserror::Error;

/// Secret access failures.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("secret provider error: {0}")]
    Provider(String),
}

/// Port for secret material (TLS keys, auth signing keys). The proxy core
/// never stores secrets itself; adapters front a filesystem, Kubernetes, or
/// an external manager.
#[async_trait]
pub trait SecretProvider: Send + Sync + 'static {
    async fn get(&self, name: &str) -> Result<Vec<u8>, SecretError>;
    async fn put(&self, name: &str, value: &[u8]) -> Result<(), SecretError>;
    async fn delete(&self, name: &str) -> Result<(), SecretError>;
}
