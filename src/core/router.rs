//! Route selection over a compiled snapshot.
//!
//! Candidates are routes whose path prefixes the request path, whose method
//! set permits the request method, and whose matchers all hold. Among
//! candidates the lowest `priority` wins, ties breaking on ascending `id`.
//! A longer prefix does NOT implicitly win; authors express precedence
//! through `priority`. Snapshots keep routes pre-sorted in exactly that
//! order, so the scan returns the first full match.

use std::sync::Arc;

use http::HeaderMap;

use crate::core::{
    route::MatcherSource,
    snapshot::{CompiledMatcher, CompiledRoute, RouteSnapshot},
};

/// Find the route a request dispatches to, or `None` (-> 404).
pub fn match_route(
    snapshot: &RouteSnapshot,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Option<Arc<CompiledRoute>> {
    snapshot
        .routes
        .iter()
        .find(|route| {
            path.starts_with(route.spec.path.as_str())
                && route.spec.allows_method(method)
                && route
                    .matchers
                    .iter()
                    .all(|matcher| matcher_holds(matcher, headers, query))
        })
        .cloned()
}

fn matcher_holds(matcher: &CompiledMatcher, headers: &HeaderMap, query: Option<&str>) -> bool {
    match matcher.source {
        MatcherSource::Header => {
            let value = headers
                .get(matcher.key.as_str())
                .and_then(|v| v.to_str().ok());
            matcher.holds(value)
        }
        MatcherSource::Query => matcher.holds(first_query_value(query, &matcher.key).as_deref()),
    }
}

/// First value for `key` in a raw query string. `?flag` (no `=`) yields an
/// empty value, which still satisfies `exists`.
fn first_query_value(query: Option<&str>, key: &str) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let (name, value) = match pair.split_once('=') {
            Some((name, value)) => (name, value),
            None => (pair, ""),
        };
        if name == key {
            return Some(value.to_string());
        }
    }
    None
}
