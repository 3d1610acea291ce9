//! Operator mode: `UrlPerformance` objects drive the config store
//!
//! A kube watcher feeds every event through the [`Reconciler`]. Failed
//! target lookups are retried with per-object backoff. Status writes only
//! happen on the replica holding the leader lease.

pub mod conditions;
pub mod crd;
pub mod reconciler;

pub use crd::{UrlPerformance, UrlPerformanceSpec, UrlPerformanceStatus};
pub use reconciler::{build_runtime_config, ReconcileError, Reconciler};

use crate::backoff::Backoff;
use crate::config::ConfigStore;
use crate::health::Health;
use crate::k8s::{K8sClient, LeaderFlag};
use crate::metrics::MetricsEngine;
use crate::Result;
use async_trait::async_trait;
use crd::TargetRefKind;
use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMPONENT: &str = "reconciler";

/// Answers whether the object a `UrlPerformance` points at exists
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn target_exists(&self, kind: TargetRefKind, namespace: &str, name: &str)
        -> Result<bool>;
}

pub struct Controller {
    client: K8sClient,
    reconciler: Reconciler<K8sClient>,
    leader: LeaderFlag,
    health: Arc<Health>,
}

impl Controller {
    pub fn new(
        client: K8sClient,
        store: ConfigStore,
        metrics: Arc<MetricsEngine>,
        leader: LeaderFlag,
        health: Arc<Health>,
    ) -> Self {
        let reconciler = Reconciler::new(client.clone(), store).with_metrics(metrics);
        Self {
            client,
            reconciler,
            leader,
            health,
        }
    }

    /// Watch `UrlPerformance` objects in all namespaces until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting UrlPerformance controller");
        self.health.update_component(COMPONENT, "starting", None);

        let api = self.client.url_performances_all();
        let mut events = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        let mut retries = RetryQueue::default();
        let mut backoffs: HashMap<String, Backoff> = HashMap::new();
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(object) = retries.next(), if !retries.is_empty() => {
                    let Some((namespace, name)) = object.split_once('/') else { continue };
                    match self.client.url_performances(namespace).get_opt(name).await {
                        Ok(Some(obj)) => self.apply(&obj, &mut retries, &mut backoffs).await,
                        Ok(None) => {
                            backoffs.remove(&object);
                        }
                        Err(e) => {
                            warn!(object = %object, "Requeue fetch failed: {}", e);
                        }
                    }
                }

                event = events.next() => match event {
                    Some(Ok(Event::Init)) => {
                        debug!("UrlPerformance relist started");
                        seen.clear();
                    }
                    Some(Ok(Event::InitApply(obj))) => {
                        seen.insert(obj.object_ref());
                        self.apply(&obj, &mut retries, &mut backoffs).await;
                    }
                    Some(Ok(Event::InitDone)) => {
                        let removed = self.reconciler.prune(&seen);
                        if !removed.is_empty() {
                            info!(keys = ?removed, "Removed configs of deleted UrlPerformances");
                        }
                        info!(
                            configs = self.reconciler.store().len(),
                            "UrlPerformance initial sync complete"
                        );
                        self.health.update_component(COMPONENT, "running", None);
                    }
                    Some(Ok(Event::Apply(obj))) => {
                        self.apply(&obj, &mut retries, &mut backoffs).await;
                    }
                    Some(Ok(Event::Delete(obj))) => {
                        backoffs.remove(&obj.object_ref());
                        retries.cancel(&obj.object_ref());
                        self.reconciler.cleanup(&obj);
                    }
                    Some(Err(e)) => {
                        warn!("UrlPerformance watch failed, reconnecting: {}", e);
                        self.health.update_component(COMPONENT, "reconnecting", None);
                    }
                    None => {
                        warn!("UrlPerformance watch stream ended");
                        break;
                    }
                }
            }
        }

        retries.shutdown().await;
        info!("UrlPerformance controller stopped");
    }

    async fn apply(
        &self,
        obj: &UrlPerformance,
        retries: &mut RetryQueue,
        backoffs: &mut HashMap<String, Backoff>,
    ) {
        let object = obj.object_ref();

        match self.reconciler.reconcile(obj).await {
            Ok(status) => {
                backoffs.remove(&object);
                retries.cancel(&object);
                self.write_status(obj, status).await;
            }
            Err(ReconcileError::MissingMetadata) => {
                warn!(object = %object, "Skipping UrlPerformance without name or namespace");
            }
            Err(e) => {
                let backoff = backoffs.entry(object.clone()).or_default();
                match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            object = %object,
                            attempt = backoff.attempts(),
                            "Reconcile failed, retrying in {:?}: {}",
                            delay,
                            e
                        );
                        retries.schedule(object, delay);
                    }
                    None => {
                        error!(object = %object, "Giving up on reconcile: {}", e);
                        backoffs.remove(&object);
                    }
                }
            }
        }
    }

    async fn write_status(&self, obj: &UrlPerformance, status: UrlPerformanceStatus) {
        if obj.status.as_ref() == Some(&status) {
            return;
        }
        if !self.leader.is_leader() {
            debug!(object = %obj.object_ref(), "Not the leader, skipping status update");
            return;
        }

        let (Some(namespace), Some(name)) = (&obj.metadata.namespace, &obj.metadata.name) else {
            return;
        };

        if let Err(e) = self
            .client
            .patch_url_performance_status(namespace, name, &status)
            .await
        {
            warn!(object = %obj.object_ref(), "Failed to update status: {}", e);
        }
    }
}

/// Delayed re-reconciles, at most one pending per object
///
/// Scheduling an object again replaces its pending retry.
#[derive(Default)]
struct RetryQueue {
    tasks: JoinSet<String>,
    pending: HashMap<String, AbortHandle>,
}

impl RetryQueue {
    fn schedule(&mut self, object: String, delay: Duration) {
        if let Some(previous) = self.pending.remove(&object) {
            previous.abort();
        }

        let key = object.clone();
        let handle = self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            key
        });
        self.pending.insert(object, handle);
    }

    fn cancel(&mut self, object: &str) {
        if let Some(handle) = self.pending.remove(object) {
            handle.abort();
        }
    }

    /// Retries still waiting to fire
    fn len(&self) -> usize {
        self.pending.len()
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Next object whose delay elapsed; aborted retries are skipped
    async fn next(&mut self) -> Option<String> {
        while let Some(done) = self.tasks.join_next().await {
            if let Ok(object) = done {
                self.pending.remove(&object);
                return Some(object);
            }
        }
        None
    }

    async fn shutdown(&mut self) {
        self.pending.clear();
        self.tasks.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_retry_queue_keeps_one_retry_per_object() {
        let mut queue = RetryQueue::default();
        for _ in 0..3 {
            queue.schedule("shop/web-perf".to_string(), Duration::from_millis(20));
        }
        queue.schedule("mahfil/api-perf".to_string(), Duration::from_millis(40));
        assert_eq!(queue.len(), 2);

        let first = timeout(Duration::from_secs(2), queue.next()).await.unwrap();
        assert_eq!(first.as_deref(), Some("shop/web-perf"));
        let second = timeout(Duration::from_secs(2), queue.next()).await.unwrap();
        assert_eq!(second.as_deref(), Some("mahfil/api-perf"));

        // Only the replaced retries are left, and they never fire
        let rest = timeout(Duration::from_millis(200), queue.next()).await.unwrap();
        assert_eq!(rest, None);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_retry_queue_cancel() {
        let mut queue = RetryQueue::default();
        queue.schedule("shop/web-perf".to_string(), Duration::from_millis(10));
        queue.cancel("shop/web-perf");
        assert_eq!(queue.len(), 0);

        let next = timeout(Duration::from_millis(200), queue.next()).await.unwrap();
        assert_eq!(next, None);
        queue.shutdown().await;
    }
}
