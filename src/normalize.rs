//! Request path normalization
//!
//! Collapses high-cardinality path segments (ids, uuids, tokens, query
//! strings) so that one endpoint maps to one metric series.

use crate::config::{RuntimeConfig, UrlPattern};
use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

static NUMERIC_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/\d+(/|$|\?)").expect("valid numeric id regex"));

static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"/[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}(/|$|\?)",
    )
    .expect("valid uuid regex")
});

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/[a-zA-Z0-9]{20,}(/|$|\?)").expect("valid token regex"));

static QUERY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\?.*").expect("valid query regex"));

/// Segment rules share their trailing delimiter with the next match, so
/// `/1/2` needs two passes. Bounded to keep pathological paths cheap.
const MAX_PASSES: usize = 8;

/// Apply merge prefixes, then URL patterns or the default rules
pub fn normalize_path(path: &str, config: &RuntimeConfig) -> String {
    match merge_path(path, &config.merge_prefixes) {
        Cow::Owned(merged) => normalize_url(&merged, &config.url_patterns),
        Cow::Borrowed(path) => normalize_url(path, &config.url_patterns),
    }
}

/// Paths under a merge prefix have numeric segments replaced with `{id}`
/// and their query string removed
pub fn merge_path<'a>(path: &'a str, prefixes: &[String]) -> Cow<'a, str> {
    if !prefixes.iter().any(|p| path.starts_with(p.as_str())) {
        return Cow::Borrowed(path);
    }

    let merged = replace_segments(path, &NUMERIC_ID, "/{id}$1");
    Cow::Owned(QUERY.replace(&merged, "").into_owned())
}

/// The first matching pattern rewrites the path; otherwise the default
/// id/uuid/token/query rules apply
pub fn normalize_url(path: &str, patterns: &[UrlPattern]) -> String {
    if let Some(pattern) = patterns.iter().find(|p| p.regex.is_match(path)) {
        return pattern
            .regex
            .replace_all(path, pattern.replacement.as_str())
            .into_owned();
    }

    default_rules(path)
}

pub fn default_rules(path: &str) -> String {
    let normalized = replace_segments(path, &NUMERIC_ID, "/{id}$1");
    let normalized = replace_segments(&normalized, &UUID, "/{uuid}$1");
    let normalized = replace_segments(&normalized, &TOKEN, "/{token}$1");
    QUERY.replace(&normalized, "?{query_params}").into_owned()
}

fn replace_segments(path: &str, re: &Regex, replacement: &str) -> String {
    let mut current = path.to_string();
    for _ in 0..MAX_PASSES {
        match re.replace_all(&current, replacement) {
            Cow::Borrowed(_) => break,
            Cow::Owned(next) => current = next,
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use traefik_officer_common::TargetKind;

    #[test]
    fn test_default_rules() {
        assert_eq!(
            default_rules("/api/users/12345/orders?limit=10"),
            "/api/users/{id}/orders?{query_params}"
        );
        assert_eq!(
            default_rules("/files/550e8400-e29b-41d4-a716-446655440000"),
            "/files/{uuid}"
        );
        assert_eq!(
            default_rules("/reset/abcdefghijklmnopqrstuvwxyz012345/confirm"),
            "/reset/{token}/confirm"
        );
        assert_eq!(default_rules("/api/health"), "/api/health");
    }

    #[test]
    fn test_consecutive_ids() {
        assert_eq!(default_rules("/a/1/2/3"), "/a/{id}/{id}/{id}");
        assert_eq!(default_rules("/v2/items/7?x=1"), "/v2/items/{id}?{query_params}");
    }

    #[test]
    fn test_first_matching_pattern_wins() {
        let patterns = vec![
            UrlPattern::compile(r"^/orders/[^/]+$", "/orders/{order}").unwrap(),
            UrlPattern::compile(r"^/orders/", "/never").unwrap(),
        ];

        assert_eq!(normalize_url("/orders/A-77", &patterns), "/orders/{order}");
        // No pattern matches, defaults apply
        assert_eq!(normalize_url("/users/42", &patterns), "/users/{id}");
    }

    #[test]
    fn test_merge_path() {
        let prefixes = vec!["/static/".to_string()];

        assert_eq!(
            merge_path("/static/img/123/logo.png?v=9", &prefixes),
            "/static/img/{id}/logo.png"
        );
        assert!(matches!(merge_path("/api/1", &prefixes), Cow::Borrowed("/api/1")));
    }

    #[test]
    fn test_normalize_path_with_config() {
        let mut cfg = test_config("shop", "web", TargetKind::Ingress);
        cfg.merge_prefixes = vec!["/assets/".to_string()];

        assert_eq!(normalize_path("/assets/42?v=1", &cfg), "/assets/{id}");
        assert_eq!(normalize_path("/cart/42?v=1", &cfg), "/cart/{id}?{query_params}");
    }
}
