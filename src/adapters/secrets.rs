//! Filesystem-backed secret provider.
//!
//! One file per secret under a root directory, mode 0600 on unix. Used by
//! the binary for TLS key material; auth adapters needing signing keys go
//! through the same port.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::ports::secrets::{SecretError, SecretProvider};

pub struct LocalFsSecrets {
    root: PathBuf,
}

impl LocalFsSecrets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, SecretError> {
        // Secret names are flat identifiers, never paths.
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(SecretError::Provider(format!(
                "invalid secret name '{name}'"
            )));
        }
        Ok(self.root.join(name))
    }

    async fn ensure_root(&self) -> Result<(), SecretError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| SecretError::Provider(format!("create {}: {e}", self.root.display())))
    }
}

#[async_trait]
impl SecretProvider for LocalFsSecrets {
    async fn get(&self, name: &str) -> Result<Vec<u8>, SecretError> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SecretError::NotFound(name.to_string()))
            }
            Err(e) => Err(SecretError::Provider(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn put(&self, name: &str, value: &[u8]) -> Result<(), SecretError> {
        self.ensure_root().await?;
        let path = self.path_for(name)?;
        tokio::fs::write(&path, value)
            .await
            .map_err(|e| SecretError::Provider(format!("write {}: {e}", path.display())))?;
        restrict_permissions(&path).await;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), SecretError> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SecretError::NotFound(name.to_string()))
            }
            Err(e) => Err(SecretError::Provider(format!(
                "remove {}: {e}",
                path.display()
            ))),
        }
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) =
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to restrict secret permissions");
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}
