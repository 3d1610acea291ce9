//! Streams the access logs of every ready Traefik pod
//!
//! A sync loop lists pods by label selector and keeps exactly one streamer
//! per running pod whose container is ready. Streamers stop when their pod
//! leaves the list, and a vanished pod forces an early resync.

use super::{LogSource, K8S_CHANNEL_SIZE};
use crate::backoff::Backoff;
use crate::k8s::{K8sClient, LogLines, PodInfo};
use crate::{OfficerError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use traefik_officer_common::LogLine;

pub const SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Pause before reopening a stream that ended cleanly
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Which pods to follow and which of their containers
#[derive(Debug, Clone)]
pub struct PodSelector {
    pub namespace: String,
    pub container: String,
    pub label_selector: String,
}

/// Pod discovery and log following
#[async_trait]
pub trait PodLogApi: Send + Sync + 'static {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    async fn follow_logs(&self, namespace: &str, pod: &str, container: &str) -> Result<LogLines>;
}

#[async_trait]
impl PodLogApi for K8sClient {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        K8sClient::list_pods(self, namespace, label_selector).await
    }

    async fn follow_logs(&self, namespace: &str, pod: &str, container: &str) -> Result<LogLines> {
        K8sClient::follow_logs(self, namespace, pod, container).await
    }
}

pub struct KubernetesSource<A = K8sClient> {
    api: Arc<A>,
    selector: Arc<PodSelector>,
    sync_interval: Duration,
}

impl<A: PodLogApi> KubernetesSource<A> {
    pub fn new(api: A, selector: PodSelector) -> Self {
        Self {
            api: Arc::new(api),
            selector: Arc::new(selector),
            sync_interval: SYNC_INTERVAL,
        }
    }

    pub fn with_sync_interval(mut self, sync_interval: Duration) -> Self {
        self.sync_interval = sync_interval;
        self
    }

    /// List pods once and bring the streamers in line; returns the number of
    /// streamable pods
    async fn sync(
        &self,
        registry: &Arc<Registry>,
        tracker: &TaskTracker,
        tx: &mpsc::Sender<LogLine>,
        shutdown: &CancellationToken,
    ) -> Result<usize> {
        let selector = &self.selector;
        let pods = self
            .api
            .list_pods(&selector.namespace, &selector.label_selector)
            .await?;
        registry.mark_synced();

        if pods.is_empty() {
            warn!(
                namespace = %selector.namespace,
                selector = %selector.label_selector,
                "No pods found"
            );
        }

        let live: HashSet<String> = pods
            .iter()
            .map(|pod| PodInfo::from_k8s_pod(pod, &selector.container))
            .filter(PodInfo::is_streamable)
            .map(|info| info.name)
            .collect();

        for pod in registry.retain(&live) {
            info!(pod = %pod, "Stopped log stream, pod is gone or not ready");
        }

        for pod in &live {
            let token = shutdown.child_token();
            if let Some(id) = registry.register(pod, token.clone()) {
                info!(pod = %pod, "Started log stream");
                tracker.spawn(stream_pod(
                    self.api.clone(),
                    self.selector.clone(),
                    pod.clone(),
                    id,
                    registry.clone(),
                    tx.clone(),
                    token,
                ));
            }
        }

        Ok(live.len())
    }
}

#[async_trait]
impl<A: PodLogApi> LogSource for KubernetesSource<A> {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn capacity(&self) -> usize {
        K8S_CHANNEL_SIZE
    }

    async fn run(self: Box<Self>, tx: mpsc::Sender<LogLine>, shutdown: CancellationToken) {
        info!(
            namespace = %self.selector.namespace,
            selector = %self.selector.label_selector,
            container = %self.selector.container,
            "Following Traefik pod logs"
        );

        let registry = Arc::new(Registry::default());
        let tracker = TaskTracker::new();
        let mut ticker = interval(self.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut list_backoff = Backoff::default();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = registry.resync.notified() => {}
            }

            if !registry.sync_due(self.sync_interval) {
                continue;
            }

            match self.sync(&registry, &tracker, &tx, &shutdown).await {
                Ok(streams) => {
                    list_backoff.reset();
                    debug!(streams, "Pod sync complete");
                }
                Err(e) => {
                    let delay = list_backoff.next_delay().unwrap_or_else(|| {
                        list_backoff.reset();
                        self.sync_interval
                    });
                    warn!("Pod discovery failed, retrying in {:?}: {}", delay, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        registry.cancel_all();
        tracker.close();
        tracker.wait().await;
        info!("All pod log streams stopped");
    }
}

/// Streamers by pod name; the id tells a replacement streamer apart from
/// the one it replaced
#[derive(Default)]
struct Registry {
    streams: Mutex<HashMap<String, (u64, CancellationToken)>>,
    next_id: AtomicU64,
    last_sync: Mutex<Option<Instant>>,
    resync: Notify,
}

impl Registry {
    fn sync_due(&self, every: Duration) -> bool {
        let last_sync = self.last_sync.lock().unwrap_or_else(PoisonError::into_inner);
        last_sync.map_or(true, |at| at.elapsed() >= every.mul_f64(0.9))
    }

    fn mark_synced(&self) {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    fn force_resync(&self) {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.resync.notify_one();
    }

    /// Track a new streamer; `None` if the pod already has one
    fn register(&self, pod: &str, token: CancellationToken) -> Option<u64> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if streams.contains_key(pod) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        streams.insert(pod.to_string(), (id, token));
        Some(id)
    }

    fn unregister(&self, pod: &str, id: u64) {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if streams.get(pod).is_some_and(|(current, _)| *current == id) {
            streams.remove(pod);
        }
    }

    /// Cancel and forget streamers of pods not in `live`
    fn retain(&self, live: &HashSet<String>) -> Vec<String> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = Vec::new();
        streams.retain(|pod, (_, token)| {
            if live.contains(pod) {
                return true;
            }
            token.cancel();
            removed.push(pod.clone());
            false
        });
        removed
    }

    fn cancel_all(&self) {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, (_, token)) in streams.drain() {
            token.cancel();
        }
    }

    #[cfg(test)]
    fn pods(&self) -> Vec<String> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pods: Vec<String> = streams.keys().cloned().collect();
        pods.sort();
        pods
    }
}

enum StreamEnd {
    Closed,
    ReceiverGone,
}

async fn stream_pod<A: PodLogApi>(
    api: Arc<A>,
    selector: Arc<PodSelector>,
    pod: String,
    id: u64,
    registry: Arc<Registry>,
    tx: mpsc::Sender<LogLine>,
    token: CancellationToken,
) {
    let mut backoff = Backoff::default();

    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = follow(api.as_ref(), &selector, &pod, &tx, &mut backoff) => result,
        };

        let delay = match result {
            Ok(StreamEnd::Closed) => {
                debug!(pod = %pod, "Log stream ended, reconnecting");
                RECONNECT_DELAY
            }
            Ok(StreamEnd::ReceiverGone) => break,
            Err(e) if e.is_not_found() => {
                debug!(pod = %pod, "Pod not found, forcing pod resync");
                registry.force_resync();
                break;
            }
            Err(e) => {
                let failed = LogLine::failed(Some(pod.clone()), &e);
                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = tx.send(failed) => if sent.is_err() { break },
                }

                match backoff.next_delay() {
                    Some(delay) => {
                        warn!(pod = %pod, "Error streaming logs (retrying in {:?}): {}", delay, e);
                        delay
                    }
                    None => {
                        error!(pod = %pod, "Giving up on log stream: {}", e);
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    registry.unregister(&pod, id);
    debug!(pod = %pod, "Streamer exited");
}

async fn follow<A: PodLogApi>(
    api: &A,
    selector: &PodSelector,
    pod: &str,
    tx: &mpsc::Sender<LogLine>,
    backoff: &mut Backoff,
) -> Result<StreamEnd> {
    let mut lines = api
        .follow_logs(&selector.namespace, pod, &selector.container)
        .await?;
    backoff.reset();

    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| {
            OfficerError::LogSourceError(format!("Log stream for {} failed: {}", pod, e))
        })?;
        if tx.send(LogLine::from_pod(pod, &line)).await.is_err() {
            return Ok(StreamEnd::ReceiverGone);
        }
    }

    Ok(StreamEnd::Closed)
}
