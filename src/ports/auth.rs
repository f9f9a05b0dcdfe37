use std::collections::HashMap;

use async_trait::async_trait;
use http::HeaderMap;
use thiserror::Error;

/// The identity an auth adapter resolved for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub role: String,
}

/// Authentication outcomes other than success.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AuthError {
    /// No usable credentials, or the credentials did not verify.
    #[error("unauthenticated")]
    Unauthenticated,

    /// The adapter itself failed (backing store unreachable etc.).
    #[error("auth adapter error: {0}")]
    Adapter(String),
}

/// Port implemented by every authentication mechanism (local tokens,
/// platform service identities, OIDC, opaque introspection). The `auth`
/// middleware is the only consumer.
#[async_trait]
pub trait AuthAdapter: Send + Sync + 'static {
    /// Resolve the request's identity from headers and cookies.
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        cookies: &HashMap<String, String>,
    ) -> Result<Identity, AuthError>;

    /// Short name used in `l8e_auth_attempts_total{adapter=...}`.
    fn name(&self) -> &'static str;
}
