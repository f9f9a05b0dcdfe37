//! Ordered middleware chain with short-circuit semantics.
//!
//! A middleware exposes three capabilities; the pipeline guarantees that
//! `pre_request` runs in declared order, that `post_response` runs in
//! reverse order for exactly the middlewares whose pre pass ran (including
//! a short-circuiter, which sees its own synthetic response), and that
//! `on_error` runs in reverse order with the first non-`None` response
//! suppressing the error.

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};

use crate::core::{context::RequestContext, errors::ProxyError};

/// Verdict of a middleware's pre-request pass.
pub enum PreVerdict {
    /// Proceed to the next middleware (and ultimately the upstream).
    Continue,
    /// Answer the client directly; the upstream is not contacted.
    ShortCircuit(Response<Body>),
    /// Abort with an error. Counted as a synthetic upstream fault only
    /// where a policy's `retry_on` names it; surfaced immediately otherwise.
    Fail(ProxyError),
}

/// A composable request/response interceptor declared on a route.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Registry name this instance was built from.
    fn name(&self) -> &'static str;

    /// Inspect or mutate the inbound request before forwarding.
    async fn pre_request(&self, ctx: &mut RequestContext, req: &mut Request<Body>) -> PreVerdict {
        let _ = (ctx, req);
        PreVerdict::Continue
    }

    /// Inspect or mutate the outbound response.
    async fn post_response(&self, ctx: &mut RequestContext, resp: &mut Response<Body>) {
        let _ = (ctx, resp);
    }

    /// Offer a replacement response for a data-plane error. Returning
    /// `Some` suppresses the error.
    async fn on_error(
        &self,
        ctx: &mut RequestContext,
        error: &ProxyError,
    ) -> Option<Response<Body>> {
        let _ = (ctx, error);
        None
    }
}

/// Result of running the pre-request pass over a chain.
pub enum PrePassOutcome {
    /// Every middleware returned `Continue`.
    Continue,
    /// The middleware at `index` answered directly.
    ShortCircuit {
        index: usize,
        response: Response<Body>,
    },
    /// The middleware at `index` failed.
    Fail { index: usize, error: ProxyError },
}

/// An ordered, immutable middleware chain compiled for one route.
pub struct Pipeline {
    chain: Vec<std::sync::Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new(chain: Vec<std::sync::Arc<dyn Middleware>>) -> Self {
        Self { chain }
    }

    pub fn empty() -> Self {
        Self { chain: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Run the pre-request pass in declared order.
    pub async fn run_pre(
        &self,
        ctx: &mut RequestContext,
        req: &mut Request<Body>,
    ) -> PrePassOutcome {
        for (index, mw) in self.chain.iter().enumerate() {
            match mw.pre_request(ctx, req).await {
                PreVerdict::Continue => {}
                PreVerdict::ShortCircuit(response) => {
                    tracing::debug!(middleware = mw.name(), "pipeline short-circuit");
                    return PrePassOutcome::ShortCircuit { index, response };
                }
                PreVerdict::Fail(error) => {
                    tracing::warn!(middleware = mw.name(), error = %error, "middleware failed");
                    return PrePassOutcome::Fail { index, error };
                }
            }
        }
        PrePassOutcome::Continue
    }

    /// Run the post-response pass in reverse order over `chain[..=last]`.
    pub async fn run_post(
        &self,
        ctx: &mut RequestContext,
        resp: &mut Response<Body>,
        last: usize,
    ) {
        if self.chain.is_empty() {
            return;
        }
        for mw in self.chain[..=last.min(self.chain.len() - 1)].iter().rev() {
            mw.post_response(ctx, resp).await;
        }
    }

    /// Run the full post pass (all middlewares ran their pre successfully).
    pub async fn run_post_all(&self, ctx: &mut RequestContext, resp: &mut Response<Body>) {
        if !self.chain.is_empty() {
            self.run_post(ctx, resp, self.chain.len() - 1).await;
        }
    }

    /// Offer `error` to middlewares `chain[..ran]` in reverse order. The
    /// first replacement response suppresses the error.
    pub async fn run_error(
        &self,
        ctx: &mut RequestContext,
        error: &ProxyError,
        ran: usize,
    ) -> Option<Response<Body>> {
        for mw in self.chain[..ran.min(self.chain.len())].iter().rev() {
            if let Some(resp) = mw.on_error(ctx, error).await {
                tracing::debug!(middleware = mw.name(), "error suppressed by middleware");
                return Some(resp);
            }
        }
        None
    }
}
