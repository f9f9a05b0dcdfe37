//! Local authentication adapters.
//!
//! `StaticTokenAuth` maps bearer tokens (or a session cookie) to fixed
//! identities from configuration. It is the minimal local adapter for dev
//! and single-node deployments; OIDC and platform service-identity
//! adapters live outside this crate and implement the same port.

use std::collections::HashMap;

use async_trait::async_trait;
use http::{HeaderMap, header};

use crate::ports::auth::{AuthAdapter, AuthError, Identity};

const SESSION_TOKEN_COOKIE: &str = "harbor_token";

pub struct StaticTokenAuth {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenAuth {
    pub fn new(tokens: HashMap<String, Identity>) -> Self {
        Self { tokens }
    }

    /// Build from `(token, subject, role)` triples.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, S, S)>,
        S: Into<String>,
    {
        let tokens = entries
            .into_iter()
            .map(|(token, subject, role)| {
                (
                    token.into(),
                    Identity {
                        subject: subject.into(),
                        role: role.into(),
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    fn bearer_token(headers: &HeaderMap) -> Option<String> {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    }
}

#[async_trait]
impl AuthAdapter for StaticTokenAuth {
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        cookies: &HashMap<String, String>,
    ) -> Result<Identity, AuthError> {
        let token = Self::bearer_token(headers)
            .or_else(|| cookies.get(SESSION_TOKEN_COOKIE).cloned())
            .ok_or(AuthError::Unauthenticated)?;

        self.tokens
            .get(&token)
            .cloned()
            .ok_or(AuthError::Unauthenticated)
    }

    fn name(&self) -> &'static str {
        "static-token"
    }
}

/// Adapter that authenticates nobody; routes without an `auth` middleware
/// never consult it, and routes with one reject every request. Useful as
/// the default wiring when no credentials are configured.
pub struct DenyAllAuth;

#[async_trait]
impl AuthAdapter for DenyAllAuth {
    async fn authenticate(
        &self,
        _headers: &HeaderMap,
        _cookies: &HashMap<String, String>,
    ) -> Result<Identity, AuthError> {
        Err(AuthError::Unauthenticated)
    }

    fn name(&self) -> &'static str {
        "deny-all"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> StaticTokenAuth {
        StaticTokenAuth::from_entries([("tok-1", "alice", "admin"), ("tok-2", "bob", "viewer")])
    }

    #[tokio::test]
    async fn test_bearer_token_resolves_identity() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer tok-1".parse().unwrap());
        let identity = adapter()
            .authenticate(&headers, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(identity.subject, "alice");
        assert_eq!(identity.role, "admin");
    }

    #[tokio::test]
    async fn test_cookie_token_resolves_identity() {
        let cookies = HashMap::from([(SESSION_TOKEN_COOKIE.to_string(), "tok-2".to_string())]);
        let identity = adapter()
            .authenticate(&HeaderMap::new(), &cookies)
            .await
            .unwrap();
        assert_eq!(identity.subject, "bob");
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer nope".parse().unwrap());
        assert!(matches!(
            adapter().authenticate(&headers, &HashMap::new()).await,
            Err(AuthError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_missing_credentials_rejected() {
        assert!(matches!(
            adapter().authenticate(&HeaderMap::new(), &HashMap::new()).await,
            Err(AuthError::Unauthenticated)
        ));
    }
}
