//! Turns `UrlPerformance` objects into runtime configs
//!
//! The store write is the commit point. The returned status is written back
//! by the caller on a best-effort basis.

use super::conditions::{self, set_condition};
use super::crd::{ConditionStatus, ConditionType, Phase, TargetRefKind, UrlPerformance, UrlPerformanceStatus};
use super::TargetResolver;
use crate::config::{compile_all, ConfigStore, RuntimeConfig, UrlPattern};
use crate::metrics::MetricsEngine;
use crate::OfficerError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("failed to look up {kind} {namespace}/{name}: {source}")]
    TargetLookup {
        kind: TargetRefKind,
        namespace: String,
        name: String,
        #[source]
        source: OfficerError,
    },

    #[error("object has no name or namespace")]
    MissingMetadata,
}

pub struct Reconciler<R> {
    resolver: R,
    store: ConfigStore,
    metrics: Option<Arc<MetricsEngine>>,
}

impl<R: TargetResolver> Reconciler<R> {
    pub fn new(resolver: R, store: ConfigStore) -> Self {
        Self {
            resolver,
            store,
            metrics: None,
        }
    }

    /// Report tracked paths in the status and drop the metrics of targets
    /// that stop being monitored
    pub fn with_metrics(mut self, metrics: Arc<MetricsEngine>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Bring the store in line with `obj` and compute its new status
    ///
    /// Only a failed target lookup is an error (and worth a retry); every
    /// other outcome is expressed in the returned status.
    pub async fn reconcile(
        &self,
        obj: &UrlPerformance,
    ) -> Result<UrlPerformanceStatus, ReconcileError> {
        if obj.metadata.name.is_none() || obj.metadata.namespace.is_none() {
            return Err(ReconcileError::MissingMetadata);
        }

        let owner = obj.object_ref();
        let key = obj.target_key();
        let target = &obj.spec.target_ref;
        let namespace = obj.target_namespace();
        let now = conditions::now();

        let mut status = obj.status.clone().unwrap_or_default();

        if !obj.spec.enabled {
            if self.store.remove_owned(&key, &owner).is_some() {
                self.forget(&key);
            }
            status.phase = Phase::Disabled;
            set_condition(
                &mut status.conditions,
                ConditionType::Ready,
                ConditionStatus::False,
                "Disabled",
                "Monitoring is disabled",
                &now,
            );
            debug!(object = %owner, key = %key, "UrlPerformance disabled");
            return Ok(status);
        }

        let exists = self
            .resolver
            .target_exists(target.kind, namespace, &target.name)
            .await
            .map_err(|source| ReconcileError::TargetLookup {
                kind: target.kind,
                namespace: namespace.to_string(),
                name: target.name.clone(),
                source,
            })?;

        if !exists {
            let message = format!("{} {}/{} not found", target.kind, namespace, target.name);
            warn!(object = %owner, "{}", message);
            set_condition(
                &mut status.conditions,
                ConditionType::TargetExists,
                ConditionStatus::False,
                "NotFound",
                &message,
                &now,
            );
            set_condition(
                &mut status.conditions,
                ConditionType::Ready,
                ConditionStatus::False,
                "TargetNotFound",
                &message,
                &now,
            );
            status.phase = Phase::Error;
            return Ok(status);
        }

        set_condition(
            &mut status.conditions,
            ConditionType::TargetExists,
            ConditionStatus::True,
            "Found",
            &format!("{} {}/{} exists", target.kind, namespace, target.name),
            &now,
        );

        let config = match build_runtime_config(obj) {
            Ok(config) => config,
            Err(e) => {
                warn!(object = %owner, "Rejected configuration: {}", e);
                set_condition(
                    &mut status.conditions,
                    ConditionType::ConfigGenerated,
                    ConditionStatus::False,
                    "InvalidRegex",
                    &e.to_string(),
                    &now,
                );
                set_condition(
                    &mut status.conditions,
                    ConditionType::Ready,
                    ConditionStatus::False,
                    "InvalidRegex",
                    &e.to_string(),
                    &now,
                );
                status.phase = Phase::Error;
                return Ok(status);
            }
        };

        let outcome = self.store.upsert(config);
        info!(object = %owner, key = %key, ?outcome, "Reconciled UrlPerformance");

        set_condition(
            &mut status.conditions,
            ConditionType::ConfigGenerated,
            ConditionStatus::True,
            "Generated",
            "Runtime configuration generated",
            &now,
        );
        set_condition(
            &mut status.conditions,
            ConditionType::Ready,
            ConditionStatus::True,
            "Ready",
            "Monitoring is active",
            &now,
        );
        status.phase = Phase::Active;
        // Sampled once per generation; the count moves with traffic
        if status.observed_generation != obj.metadata.generation {
            if let Some(metrics) = &self.metrics {
                status.monitored_paths =
                    Some(metrics.tracked_paths(&key).min(i32::MAX as usize) as i32);
            }
        }
        status.observed_generation = obj.metadata.generation;

        Ok(status)
    }

    /// The object was deleted
    pub fn cleanup(&self, obj: &UrlPerformance) -> bool {
        let removed = self
            .store
            .remove_owned(&obj.target_key(), &obj.object_ref())
            .is_some();
        if removed {
            info!(object = %obj.object_ref(), "UrlPerformance deleted");
            self.forget(&obj.target_key());
        }
        removed
    }

    /// Drop configs of objects that no longer exist
    pub fn prune(&self, live_owners: &HashSet<String>) -> Vec<String> {
        let removed = self.store.retain_owners(live_owners);
        for key in &removed {
            self.forget(key);
        }
        removed
    }

    fn forget(&self, key: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.forget_router(key);
        }
    }
}

/// Compile a `UrlPerformance` into a runtime config; the first invalid regex rejects
/// the whole object
pub fn build_runtime_config(obj: &UrlPerformance) -> crate::Result<RuntimeConfig> {
    let spec = &obj.spec;

    let url_patterns = spec
        .url_patterns
        .iter()
        .map(|p| UrlPattern::compile(&p.pattern, &p.replacement))
        .collect::<crate::Result<Vec<_>>>()?;

    Ok(RuntimeConfig {
        key: obj.target_key(),
        namespace: obj.target_namespace().trim().to_string(),
        target_name: spec.target_ref.name.trim().to_string(),
        target_kind: spec.target_ref.kind.into(),
        owner: obj.object_ref(),
        whitelist: compile_all(&spec.whitelist_paths_regex)?,
        ignored: compile_all(&spec.ignored_paths_regex)?,
        merge_prefixes: spec.merge_paths_with_extensions.clone(),
        url_patterns,
        collect_n_top: spec.collect_n_top.clamp(1, 1000) as usize,
        enabled: spec.enabled,
        last_updated: SystemTime::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::conditions::find;
    use crate::Result;
    use async_trait::async_trait;
    use crate::metrics::EndpointTarget;
    use std::sync::atomic::{AtomicBool, Ordering};
    use traefik_officer_common::{AccessRecord, TargetKind};

    struct FakeResolver {
        exists: AtomicBool,
        fail: AtomicBool,
    }

    impl FakeResolver {
        fn new(exists: bool) -> Self {
            Self {
                exists: AtomicBool::new(exists),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TargetResolver for FakeResolver {
        async fn target_exists(&self, _: TargetRefKind, _: &str, _: &str) -> Result<bool> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(OfficerError::KubernetesError("connection refused".into()));
            }
            Ok(self.exists.load(Ordering::SeqCst))
        }
    }

    fn object(extra: &str) -> UrlPerformance {
        let yaml = format!(
            r#"
apiVersion: traefikofficer.io/v1alpha1
kind: UrlPerformance
metadata:
  name: api-perf
  namespace: mahfil
  generation: 2
spec:
  targetRef:
    kind: IngressRoute
    name: dev-api
{extra}"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[tokio::test]
    async fn test_reconcile_active() {
        let reconciler = Reconciler::new(FakeResolver::new(true), ConfigStore::new());
        let status = reconciler
            .reconcile(&object("  collectNTop: 7\n"))
            .await
            .unwrap();

        assert_eq!(status.phase, Phase::Active);
        assert_eq!(status.observed_generation, Some(2));
        for type_ in [
            ConditionType::TargetExists,
            ConditionType::ConfigGenerated,
            ConditionType::Ready,
        ] {
            assert_eq!(
                find(&status.conditions, type_).unwrap().status,
                ConditionStatus::True
            );
        }

        let config = reconciler.store().get("mahfil-dev-api").unwrap();
        assert_eq!(config.target_kind, TargetKind::IngressRoute);
        assert_eq!(config.collect_n_top, 7);
        assert_eq!(config.owner, "mahfil/api-perf");
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let reconciler = Reconciler::new(FakeResolver::new(true), ConfigStore::new());
        let mut obj = object("");

        let first = reconciler.reconcile(&obj).await.unwrap();
        let stored = reconciler.store().get("mahfil-dev-api").unwrap();

        obj.status = Some(first.clone());
        let second = reconciler.reconcile(&obj).await.unwrap();

        assert_eq!(first, second);
        assert!(Arc::ptr_eq(
            &stored,
            &reconciler.store().get("mahfil-dev-api").unwrap()
        ));
    }

    #[tokio::test]
    async fn test_missing_target_leaves_store_untouched() {
        let resolver = FakeResolver::new(true);
        let reconciler = Reconciler::new(resolver, ConfigStore::new());
        reconciler.reconcile(&object("")).await.unwrap();

        reconciler.resolver.exists.store(false, Ordering::SeqCst);
        let status = reconciler
            .reconcile(&object("  collectNTop: 3\n"))
            .await
            .unwrap();

        assert_eq!(status.phase, Phase::Error);
        let target = find(&status.conditions, ConditionType::TargetExists).unwrap();
        assert_eq!(target.status, ConditionStatus::False);
        assert_eq!(target.reason, "NotFound");
        // Previous config is still served
        assert_eq!(reconciler.store().get("mahfil-dev-api").unwrap().collect_n_top, 20);
    }

    #[tokio::test]
    async fn test_invalid_regex() {
        let reconciler = Reconciler::new(FakeResolver::new(true), ConfigStore::new());
        let status = reconciler
            .reconcile(&object("  whitelistPathsRegex: [\"^/api/(\"]\n"))
            .await
            .unwrap();

        assert_eq!(status.phase, Phase::Error);
        let generated = find(&status.conditions, ConditionType::ConfigGenerated).unwrap();
        assert_eq!(generated.status, ConditionStatus::False);
        assert_eq!(generated.reason, "InvalidRegex");
        assert!(reconciler.store().is_empty());
    }

    #[tokio::test]
    async fn test_disable_and_delete() {
        let reconciler = Reconciler::new(FakeResolver::new(true), ConfigStore::new());
        reconciler.reconcile(&object("")).await.unwrap();
        assert_eq!(reconciler.store().len(), 1);

        let status = reconciler.reconcile(&object("  enabled: false\n")).await.unwrap();
        assert_eq!(status.phase, Phase::Disabled);
        assert_eq!(
            find(&status.conditions, ConditionType::Ready).unwrap().reason,
            "Disabled"
        );
        assert!(reconciler.store().is_empty());

        reconciler.reconcile(&object("")).await.unwrap();
        assert!(reconciler.cleanup(&object("")));
        assert!(reconciler.store().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failure_is_an_error() {
        let resolver = FakeResolver::new(true);
        resolver.fail.store(true, Ordering::SeqCst);
        let reconciler = Reconciler::new(resolver, ConfigStore::new());

        assert!(matches!(
            reconciler.reconcile(&object("")).await,
            Err(ReconcileError::TargetLookup { .. })
        ));
    }

    #[tokio::test]
    async fn test_prune() {
        let reconciler = Reconciler::new(FakeResolver::new(true), ConfigStore::new());
        reconciler.reconcile(&object("")).await.unwrap();

        let removed = reconciler.prune(&HashSet::new());
        assert_eq!(removed, vec!["mahfil-dev-api".to_string()]);
    }

    fn observe_path(metrics: &MetricsEngine, path: &str) {
        let target = EndpointTarget {
            router: "mahfil-dev-api",
            namespace: "mahfil",
            ingress: "dev-api",
            kind: TargetKind::IngressRoute,
            app: "mahfil-dev-api-a1b2c3d4e5f6a7b8@kubernetescrd",
        };
        let record = AccessRecord {
            method: "GET".to_string(),
            origin_status: 200,
            duration_ms: 20.0,
            ..Default::default()
        };
        metrics.observe(&target, &record, path, 20);
    }

    #[tokio::test]
    async fn test_status_stable_while_traffic_grows() {
        let metrics = Arc::new(MetricsEngine::new().unwrap());
        let reconciler =
            Reconciler::new(FakeResolver::new(true), ConfigStore::new()).with_metrics(metrics.clone());
        observe_path(&metrics, "/api/orders");

        let mut obj = object("");
        let first = reconciler.reconcile(&obj).await.unwrap();
        assert_eq!(first.monitored_paths, Some(1));

        // The status write comes back as another event while new paths arrive
        observe_path(&metrics, "/api/users");
        observe_path(&metrics, "/api/items");
        obj.status = Some(first.clone());
        let second = reconciler.reconcile(&obj).await.unwrap();
        assert_eq!(first, second);

        // A new generation samples the count again
        obj.metadata.generation = Some(3);
        let third = reconciler.reconcile(&obj).await.unwrap();
        assert_eq!(third.monitored_paths, Some(3));
        assert_eq!(third.observed_generation, Some(3));
    }

    #[tokio::test]
    async fn test_removed_target_forgets_metrics() {
        let metrics = Arc::new(MetricsEngine::new().unwrap());
        let reconciler =
            Reconciler::new(FakeResolver::new(true), ConfigStore::new()).with_metrics(metrics.clone());

        reconciler.reconcile(&object("")).await.unwrap();
        observe_path(&metrics, "/api/orders");
        reconciler.reconcile(&object("  enabled: false\n")).await.unwrap();
        assert_eq!(metrics.tracked_paths("mahfil-dev-api"), 0);

        reconciler.reconcile(&object("")).await.unwrap();
        observe_path(&metrics, "/api/orders");
        assert!(reconciler.cleanup(&object("")));
        assert_eq!(metrics.tracked_paths("mahfil-dev-api"), 0);

        reconciler.reconcile(&object("")).await.unwrap();
        observe_path(&metrics, "/api/orders");
        reconciler.prune(&HashSet::new());
        assert_eq!(metrics.tracked_paths("mahfil-dev-api"), 0);
    }
}
