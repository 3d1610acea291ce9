//! Per-target filtering and normalization rules
//!
//! A `RuntimeConfig` is the compiled form of one `UrlPerformance` object (or,
//! in legacy mode, of one allowed service from the config file). Configs are
//! immutable once built and shared between the store and the processor as
//! `Arc<RuntimeConfig>`.

pub mod legacy;
pub mod store;

use crate::{OfficerError, Result};
use regex::Regex;
use std::time::SystemTime;
use tracing::warn;
use traefik_officer_common::TargetKind;

pub use legacy::{LegacyConfig, LegacyRules};
pub use store::{ConfigStore, UpsertOutcome};

pub const DEFAULT_COLLECT_N_TOP: usize = 20;

/// A compiled `pattern -> replacement` rewrite rule
#[derive(Debug, Clone)]
pub struct UrlPattern {
    pub regex: Regex,
    pub replacement: String,
}

impl UrlPattern {
    pub fn compile(pattern: &str, replacement: &str) -> Result<Self> {
        Ok(Self {
            regex: compile_regex(pattern)?,
            replacement: replacement.to_string(),
        })
    }
}

impl PartialEq for UrlPattern {
    fn eq(&self, other: &Self) -> bool {
        self.regex.as_str() == other.regex.as_str() && self.replacement == other.replacement
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `<namespace>-<target_name>`
    pub key: String,
    pub namespace: String,
    pub target_name: String,
    pub target_kind: TargetKind,
    /// `<namespace>/<name>` of the object this config was built from
    pub owner: String,
    pub whitelist: Vec<Regex>,
    pub ignored: Vec<Regex>,
    pub merge_prefixes: Vec<String>,
    pub url_patterns: Vec<UrlPattern>,
    pub collect_n_top: usize,
    pub enabled: bool,
    pub last_updated: SystemTime,
}

impl RuntimeConfig {
    /// Whether two configs apply the same rules (`last_updated` is ignored)
    pub fn same_rules(&self, other: &RuntimeConfig) -> bool {
        self.key == other.key
            && self.namespace == other.namespace
            && self.target_name == other.target_name
            && self.target_kind == other.target_kind
            && self.owner == other.owner
            && same_regexes(&self.whitelist, &other.whitelist)
            && same_regexes(&self.ignored, &other.ignored)
            && self.merge_prefixes == other.merge_prefixes
            && self.url_patterns == other.url_patterns
            && self.collect_n_top == other.collect_n_top
            && self.enabled == other.enabled
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignored.iter().any(|re| re.is_match(path))
    }

    /// An empty whitelist admits every path
    pub fn is_whitelisted(&self, path: &str) -> bool {
        self.whitelist.is_empty() || self.whitelist.iter().any(|re| re.is_match(path))
    }
}

fn same_regexes(a: &[Regex], b: &[Regex]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.as_str() == y.as_str())
}

pub fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| OfficerError::InvalidRegex {
        pattern: pattern.to_string(),
        source,
    })
}

/// Compile every pattern, failing on the first one that does not compile
pub fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| compile_regex(p)).collect()
}

/// Compile every pattern, dropping the ones that do not compile
pub fn compile_lenient<'a, I>(patterns: I, what: &str) -> Vec<Regex>
where
    I: IntoIterator<Item = &'a String>,
{
    patterns
        .into_iter()
        .filter_map(|p| match compile_regex(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %p, "Ignoring invalid {} pattern: {}", what, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn test_config(namespace: &str, name: &str, kind: TargetKind) -> RuntimeConfig {
    RuntimeConfig {
        key: traefik_officer_common::target_key(namespace, name),
        namespace: namespace.to_string(),
        target_name: name.to_string(),
        target_kind: kind,
        owner: format!("{}/{}-perf", namespace, name),
        whitelist: Vec::new(),
        ignored: Vec::new(),
        merge_prefixes: Vec::new(),
        url_patterns: Vec::new(),
        collect_n_top: DEFAULT_COLLECT_N_TOP,
        enabled: true,
        last_updated: SystemTime::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters() {
        let mut cfg = test_config("shop", "web", TargetKind::Ingress);
        assert!(cfg.is_whitelisted("/anything"));

        cfg.whitelist = compile_all(&["^/api/".to_string()]).unwrap();
        cfg.ignored = compile_all(&[r"\.css$".to_string()]).unwrap();

        assert!(cfg.is_whitelisted("/api/users"));
        assert!(!cfg.is_whitelisted("/login"));
        assert!(cfg.is_ignored("/static/app.css"));
        assert!(!cfg.is_ignored("/api/users"));
    }

    #[test]
    fn test_compile_all_reports_first_failure() {
        let err = compile_all(&["^ok$".to_string(), "([".to_string(), "(".to_string()])
            .unwrap_err();
        match err {
            OfficerError::InvalidRegex { pattern, .. } => assert_eq!(pattern, "(["),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_compile_lenient_drops_invalid() {
        let patterns = vec!["^/a".to_string(), "([".to_string()];
        let compiled = compile_lenient(&patterns, "test");
        assert_eq!(compiled.len(), 1);
    }

    #[test]
    fn test_same_rules_ignores_timestamp() {
        let a = test_config("shop", "web", TargetKind::Ingress);
        let mut b = a.clone();
        b.last_updated = SystemTime::UNIX_EPOCH;
        assert!(a.same_rules(&b));

        b.collect_n_top = 5;
        assert!(!a.same_rules(&b));
    }
}
