//! `auth` middleware: delegates credential verification to the configured
//! [`AuthAdapter`] and enforces role requirements.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use axum::body::Body;
use hyper::Request;
use serde::Deserialize;

use crate::{
    core::{
        context::RequestContext,
        middleware::{PathPattern, error_response},
        pipeline::{Middleware, PreVerdict},
    },
    metrics,
    ports::auth::{AuthAdapter, AuthError},
};

fn default_require_auth() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default = "default_require_auth")]
    pub require_auth: bool,
    /// Roles accepted route-wide; empty means any authenticated identity.
    #[serde(default)]
    pub require_role: Vec<String>,
    /// Path patterns that skip authentication entirely.
    #[serde(default)]
    pub allow_anonymous_paths: Vec<String>,
    /// Per-path role overrides; first matching pattern wins.
    #[serde(default)]
    pub path_roles: BTreeMap<String, Vec<String>>,
}

pub struct AuthMiddleware {
    adapter: Arc<dyn AuthAdapter>,
    require_auth: bool,
    require_role: Vec<String>,
    anonymous: Vec<PathPattern>,
    path_roles: Vec<(PathPattern, Vec<String>)>,
}

impl AuthMiddleware {
    pub fn build(config: AuthConfig, adapter: Arc<dyn AuthAdapter>) -> Result<Self, String> {
        let anonymous = config
            .allow_anonymous_paths
            .iter()
            .map(|p| PathPattern::compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        let path_roles = config
            .path_roles
            .iter()
            .map(|(p, roles)| PathPattern::compile(p).map(|pat| (pat, roles.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            adapter,
            require_auth: config.require_auth,
            require_role: config.require_role,
            anonymous,
            path_roles,
        })
    }

    fn required_roles(&self, path: &str) -> &[String] {
        for (pattern, roles) in &self.path_roles {
            if pattern.matches(path) {
                return roles;
            }
        }
        &self.require_role
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn pre_request(&self, ctx: &mut RequestContext, req: &mut Request<Body>) -> PreVerdict {
        let path = req.uri().path().to_string();

        if self.anonymous.iter().any(|p| p.matches(&path)) {
            return PreVerdict::Continue;
        }

        match self.adapter.authenticate(req.headers(), &ctx.cookies).await {
            Ok(identity) => {
                metrics::record_auth_attempt(self.adapter.name(), true);
                let required = self.required_roles(&path);
                if !required.is_empty() && !required.contains(&identity.role) {
                    tracing::debug!(
                        subject = %identity.subject,
                        role = %identity.role,
                        "identity lacks required role"
                    );
                    return PreVerdict::ShortCircuit(error_response(
                        http::StatusCode::FORBIDDEN,
                        "forbidden",
                        &ctx.request_id,
                    ));
                }
                ctx.identity = Some(identity);
                PreVerdict::Continue
            }
            Err(AuthError::Unauthenticated) => {
                metrics::record_auth_attempt(self.adapter.name(), false);
                if self.require_auth {
                    PreVerdict::ShortCircuit(error_response(
                        http::StatusCode::UNAUTHORIZED,
                        "unauthenticated",
                        &ctx.request_id,
                    ))
                } else {
                    PreVerdict::Continue
                }
            }
            Err(AuthError::Adapter(message)) => {
                metrics::record_auth_attempt(self.adapter.name(), false);
                PreVerdict::Fail(crate::core::errors::ProxyError::MiddlewareFailure {
                    middleware: "auth".into(),
                    message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use http::HeaderMap;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::ports::auth::Identity;

    struct FixedAuth(Option<Identity>);

    #[async_trait]
    impl AuthAdapter for FixedAuth {
        async fn authenticate(
            &self,
            _headers: &HeaderMap,
            _cookies: &HashMap<String, String>,
        ) -> Result<Identity, AuthError> {
            self.0.clone().ok_or(AuthError::Unauthenticated)
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(
            "r".into(),
            "route".into(),
            None,
            "http",
            Default::default(),
            CancellationToken::new(),
        )
    }

    fn req(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    fn config(json: serde_json::Value) -> AuthConfig {
        serde_json::from_value(json).unwrap()
    }

    #[tokio::test]
    async fn test_unauthenticated_is_rejected() {
        let mw = AuthMiddleware::build(
            config(serde_json::json!({})),
            Arc::new(FixedAuth(None)),
        )
        .unwrap();
        let verdict = mw.pre_request(&mut ctx(), &mut req("/api")).await;
        match verdict {
            PreVerdict::ShortCircuit(resp) => {
                assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED)
            }
            _ => panic!("expected 401 short-circuit"),
        }
    }

    #[tokio::test]
    async fn test_anonymous_path_skips_auth() {
        let mw = AuthMiddleware::build(
            config(serde_json::json!({"allow_anonymous_paths": ["/public/*"]})),
            Arc::new(FixedAuth(None)),
        )
        .unwrap();
        let verdict = mw.pre_request(&mut ctx(), &mut req("/public/doc")).await;
        assert!(matches!(verdict, PreVerdict::Continue));
    }

    #[tokio::test]
    async fn test_role_requirement_enforced() {
        let identity = Identity {
            subject: "alice".into(),
            role: "viewer".into(),
        };
        let mw = AuthMiddleware::build(
            config(serde_json::json!({"require_role": ["admin"]})),
            Arc::new(FixedAuth(Some(identity))),
        )
        .unwrap();
        let verdict = mw.pre_request(&mut ctx(), &mut req("/api")).await;
        match verdict {
            PreVerdict::ShortCircuit(resp) => {
                assert_eq!(resp.status(), http::StatusCode::FORBIDDEN)
            }
            _ => panic!("expected 403 short-circuit"),
        }
    }

    #[tokio::test]
    async fn test_path_roles_override_route_roles() {
        let identity = Identity {
            subject: "bob".into(),
            role: "operator".into(),
        };
        let mw = AuthMiddleware::build(
            config(serde_json::json!({
                "require_role": ["admin"],
                "path_roles": {"/metrics/*": ["operator"]}
            })),
            Arc::new(FixedAuth(Some(identity))),
        )
        .unwrap();
        let mut c = ctx();
        let verdict = mw.pre_request(&mut c, &mut req("/metrics/cpu")).await;
        assert!(matches!(verdict, PreVerdict::Continue));
        assert_eq!(c.identity.as_ref().unwrap().subject, "bob");
    }
}
