//! Static rules loaded from a config file (non-operator mode)
//!
//! The file is JSON, or YAML when the extension is `.yaml`/`.yml`. Every
//! allowed service becomes one `RuntimeConfig`, so both modes share the same
//! filtering and normalization path downstream.

use super::{compile_lenient, RuntimeConfig, UrlPattern, DEFAULT_COLLECT_N_TOP};
use crate::{OfficerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use traefik_officer_common::{target_key, RouterIdentity, TargetKind};

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AllowedService {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Namespace", default)]
    pub namespace: String,
}

impl AllowedService {
    pub fn key(&self) -> String {
        target_key(&self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LegacyUrlPattern {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub namespace: String,
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LegacyConfig {
    #[serde(rename = "IgnoredRouters", default)]
    pub ignored_routers: Vec<String>,
    #[serde(rename = "IgnoredPathsRegex", default)]
    pub ignored_paths_regex: Vec<String>,
    #[serde(rename = "MergePathsWithExtensions", default)]
    pub merge_paths_with_extensions: Vec<String>,
    #[serde(rename = "URLPatterns", default)]
    pub url_patterns: Vec<LegacyUrlPattern>,
    #[serde(rename = "AllowedServices", default)]
    pub allowed_services: Vec<AllowedService>,
    #[serde(rename = "TopNPaths", default)]
    pub top_n_paths: usize,
    #[serde(rename = "Debug", default)]
    pub debug: bool,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            ignored_routers: Vec::new(),
            ignored_paths_regex: Vec::new(),
            merge_paths_with_extensions: Vec::new(),
            url_patterns: Vec::new(),
            allowed_services: Vec::new(),
            top_n_paths: DEFAULT_COLLECT_N_TOP,
            debug: false,
        }
    }
}

impl LegacyConfig {
    /// Load the file at `path`; an empty file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OfficerError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;

        if raw.trim().is_empty() {
            warn!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );

        let mut config: Self = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| {
                OfficerError::ConfigError(format!("cannot parse {}: {}", path.display(), e))
            })?
        } else {
            serde_json::from_str(&raw).map_err(|e| {
                OfficerError::ConfigError(format!("cannot parse {}: {}", path.display(), e))
            })?
        };

        if config.top_n_paths == 0 {
            config.top_n_paths = DEFAULT_COLLECT_N_TOP;
        }

        info!(
            path = %path.display(),
            services = config.allowed_services.len(),
            top_n = config.top_n_paths,
            "Loaded config file"
        );
        Ok(config)
    }

    /// Compile into per-service runtime configs
    ///
    /// Invalid regexes are dropped with a warning rather than rejecting the
    /// whole file.
    pub fn compile(&self) -> LegacyRules {
        let ignored = compile_lenient(&self.ignored_paths_regex, "ignored path");
        let now = SystemTime::now();

        let services = self
            .allowed_services
            .iter()
            .map(|service| {
                let key = service.key();
                let url_patterns = self
                    .url_patterns
                    .iter()
                    .filter(|p| target_key(&p.namespace, &p.service_name) == key)
                    .filter_map(|p| match UrlPattern::compile(&p.pattern, &p.replacement) {
                        Ok(pattern) => Some(pattern),
                        Err(e) => {
                            warn!(service = %key, "Ignoring URL pattern: {}", e);
                            None
                        }
                    })
                    .collect();

                Arc::new(RuntimeConfig {
                    key: key.clone(),
                    namespace: service.namespace.trim().to_string(),
                    target_name: service.name.trim().to_string(),
                    target_kind: TargetKind::Unknown,
                    owner: format!("config-file/{}", key),
                    whitelist: Vec::new(),
                    ignored: ignored.clone(),
                    merge_prefixes: self.merge_paths_with_extensions.clone(),
                    url_patterns,
                    collect_n_top: self.top_n_paths,
                    enabled: true,
                    last_updated: now,
                })
            })
            .collect();

        LegacyRules {
            ignored_routers: self.ignored_routers.clone(),
            services,
        }
    }
}

/// Why a router was rejected by the allow-list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    IgnoredRouter,
    NotAllowed,
}

#[derive(Debug, Clone, Default)]
pub struct LegacyRules {
    ignored_routers: Vec<String>,
    services: Vec<Arc<RuntimeConfig>>,
}

impl LegacyRules {
    /// Find the allowed service a router belongs to
    ///
    /// The decoded identity is preferred; routers that do not decode fall
    /// back to a prefix match of the raw name against `<namespace>-<name>`.
    pub fn lookup(&self, router_name: &str) -> std::result::Result<Arc<RuntimeConfig>, Rejection> {
        if self
            .ignored_routers
            .iter()
            .any(|ignored| !ignored.is_empty() && router_name.contains(ignored.as_str()))
        {
            return Err(Rejection::IgnoredRouter);
        }

        let found = match RouterIdentity::decode(router_name).key() {
            Some(key) => self.services.iter().find(|s| s.key == key),
            None => self
                .services
                .iter()
                .find(|s| !s.key.is_empty() && router_name.starts_with(&s.key)),
        };

        match found {
            Some(config) => Ok(Arc::clone(config)),
            None => {
                debug!(router = router_name, "Router not in allowed services");
                Err(Rejection::NotAllowed)
            }
        }
    }

    pub fn services(&self) -> &[Arc<RuntimeConfig>] {
        &self.services
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const JSON_CONFIG: &str = r#"{
        "IgnoredRouters": ["dashboard"],
        "IgnoredPathsRegex": ["^/healthz", "(["],
        "MergePathsWithExtensions": ["/static/"],
        "URLPatterns": [
            {"service_name": "web", "namespace": "shop", "pattern": "^/orders/[^/]+$", "replacement": "/orders/{order}"},
            {"service_name": "web", "namespace": "shop", "pattern": "(", "replacement": "x"},
            {"service_name": "other", "namespace": "shop", "pattern": "^/x$", "replacement": "/y"}
        ],
        "AllowedServices": [{"Name": "web", "Namespace": "shop"}],
        "TopNPaths": 5
    }"#;

    fn write_config(suffix: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_json() {
        let file = write_config(".json", JSON_CONFIG);
        let config = LegacyConfig::load(file.path()).unwrap();

        assert_eq!(config.top_n_paths, 5);
        assert_eq!(config.allowed_services.len(), 1);
        assert_eq!(config.allowed_services[0].key(), "shop-web");
        assert_eq!(config.url_patterns.len(), 3);
    }

    #[test]
    fn test_load_yaml_defaults_top_n() {
        let yaml = "AllowedServices:\n  - Name: web\n    Namespace: shop\n";
        let file = write_config(".yaml", yaml);
        let config = LegacyConfig::load(file.path()).unwrap();

        assert_eq!(config.top_n_paths, DEFAULT_COLLECT_N_TOP);
        assert_eq!(config.allowed_services[0].name, "web");
    }

    #[test]
    fn test_load_empty_file_uses_defaults() {
        let file = write_config(".json", "   ");
        assert_eq!(LegacyConfig::load(file.path()).unwrap(), LegacyConfig::default());
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let file = write_config(".json", "{not json");
        assert!(matches!(
            LegacyConfig::load(file.path()),
            Err(OfficerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_compile_drops_invalid_patterns() {
        let file = write_config(".json", JSON_CONFIG);
        let rules = LegacyConfig::load(file.path()).unwrap().compile();

        let service = &rules.services()[0];
        assert_eq!(service.ignored.len(), 1);
        // Only the valid pattern scoped to shop-web survives
        assert_eq!(service.url_patterns.len(), 1);
        assert_eq!(service.merge_prefixes, vec!["/static/".to_string()]);
        assert_eq!(service.collect_n_top, 5);
    }

    #[test]
    fn test_lookup() {
        let file = write_config(".json", JSON_CONFIG);
        let rules = LegacyConfig::load(file.path()).unwrap().compile();

        // Decoded identity
        let found = rules
            .lookup("websecure-shop-web-0123456789abcdef@kubernetes")
            .unwrap();
        assert_eq!(found.key, "shop-web");

        // Prefix fallback for routers without a hash
        assert!(rules.lookup("shop-web-example-com@kubernetes").is_ok());

        assert_eq!(
            rules.lookup("shop-dashboard-0123456789abcdef@kubernetescrd").unwrap_err(),
            Rejection::IgnoredRouter
        );
        assert_eq!(
            rules.lookup("websecure-blog-site-0123456789abcdef@kubernetes").unwrap_err(),
            Rejection::NotAllowed
        );
    }
}
