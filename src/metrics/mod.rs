//! Metrics engine
//!
//! Every accepted record updates the coarse request metrics and the
//! cumulative endpoint stats. Per-endpoint series are only projected for the
//! endpoints in the current top-N set, which keeps label cardinality bounded
//! by the sum of the configured `collect_n_top` values.

pub mod collector;
pub mod exporter;
pub mod topn;

pub use collector::{EndpointKey, EndpointStat, EndpointStats};
pub use exporter::OfficerMetrics;
pub use topn::{TopNSet, TopPaths};

use crate::config::DEFAULT_COLLECT_N_TOP;
use crate::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use traefik_officer_common::{AccessRecord, TargetKind};

pub const TOP_PATHS_INTERVAL: Duration = Duration::from_secs(30);
pub const SERIES_RESET_INTERVAL: Duration = Duration::from_secs(3600);

/// Labels of the target a record was attributed to
#[derive(Debug, Clone, Copy)]
pub struct EndpointTarget<'a> {
    /// Config key, `<namespace>-<name>`
    pub router: &'a str,
    pub namespace: &'a str,
    pub ingress: &'a str,
    pub kind: TargetKind,
    /// Raw Traefik router name
    pub app: &'a str,
}

#[derive(Debug, Clone)]
struct RouterInfo {
    namespace: String,
    ingress: String,
    top_n: usize,
}

pub struct MetricsEngine {
    metrics: OfficerMetrics,
    stats: EndpointStats,
    top_paths: TopPaths,
    routers: DashMap<String, RouterInfo>,
}

impl MetricsEngine {
    pub fn new() -> Result<Self> {
        Ok(Self {
            metrics: OfficerMetrics::new()?,
            stats: EndpointStats::new(),
            top_paths: TopPaths::new(),
            routers: DashMap::new(),
        })
    }

    pub fn metrics(&self) -> &OfficerMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// Record one accepted request under its normalized path
    pub fn observe(
        &self,
        target: &EndpointTarget<'_>,
        record: &AccessRecord,
        path: &str,
        top_n: usize,
    ) {
        let duration = record.duration_seconds();
        let code = record.origin_status.to_string();

        let coarse = [
            record.method.as_str(),
            code.as_str(),
            target.app,
            target.namespace,
            target.kind.as_str(),
        ];
        self.metrics.requests_total.with_label_values(&coarse).inc();
        self.metrics
            .request_duration
            .with_label_values(&coarse)
            .observe(duration);

        self.remember_router(target, top_n);

        let stat = self.stats.record(
            EndpointKey {
                router: target.router.to_string(),
                path: path.to_string(),
            },
            duration,
            record.origin_status,
        );

        if !self.top_paths.contains(target.router, path) {
            return;
        }

        let endpoint = [
            target.namespace,
            target.ingress,
            path,
            record.method.as_str(),
            code.as_str(),
        ];
        self.metrics
            .endpoint_requests
            .with_label_values(&endpoint)
            .inc();
        self.metrics
            .endpoint_duration
            .with_label_values(&endpoint)
            .observe(duration);

        let labels = [target.namespace, target.ingress, path];
        self.set_latency_gauges(&labels, &stat);

        if stat.error_count > 0 {
            self.metrics
                .endpoint_error_rate
                .with_label_values(&labels)
                .set(stat.error_rate());
            self.metrics
                .endpoint_client_error_rate
                .with_label_values(&labels)
                .set(stat.client_error_rate());
            self.metrics
                .endpoint_server_error_rate
                .with_label_values(&labels)
                .set(stat.server_error_rate());
        }
    }

    /// JSON logs only
    pub fn observe_overhead(&self, record: &AccessRecord) {
        self.metrics
            .traefik_overhead
            .observe(record.overhead_seconds());
    }

    pub fn count_line(&self, outcome: &str) {
        self.metrics.lines_total.with_label_values(&[outcome]).inc();
    }

    /// Recompute the top-N set
    ///
    /// Latency gauges of endpoints that fell out of the set are removed.
    /// Gauges of endpoints in the set are only written by `observe`, so a
    /// series reset stays in effect until new traffic arrives. Returns the
    /// number of projected endpoints.
    pub fn refresh_top_paths(&self) -> usize {
        let rows = self.stats.snapshot();
        let next = TopNSet::compute(&rows, |router| {
            self.routers
                .get(router)
                .map_or(DEFAULT_COLLECT_N_TOP, |info| info.top_n)
        });

        let previous = self.top_paths.load();
        for (router, path) in previous.iter() {
            if next.contains(router, path) {
                continue;
            }
            if let Some(info) = self.routers.get(router) {
                self.metrics
                    .remove_latency_gauges(&[info.namespace.as_str(), info.ingress.as_str(), path]);
            }
        }

        let projected = next.len();
        self.top_paths.swap(next);
        debug!(projected, endpoints = rows.len(), "Updated top paths");
        projected
    }

    /// Drop everything kept for a config key whose target is no longer monitored
    pub fn forget_router(&self, router: &str) {
        let Some((_, info)) = self.routers.remove(router) else {
            return;
        };

        for (_, path) in self.top_paths.load().iter().filter(|(r, _)| *r == router) {
            self.metrics
                .remove_latency_gauges(&[info.namespace.as_str(), info.ingress.as_str(), path]);
        }
        let removed = self.stats.remove_router(router);
        debug!(router, paths = removed, "Forgot endpoint stats");
    }

    pub fn top_paths(&self) -> Arc<TopNSet> {
        self.top_paths.load()
    }

    /// Distinct endpoint paths seen for a config key
    pub fn tracked_paths(&self, router: &str) -> usize {
        self.stats.paths_for(router)
    }

    pub fn reset_endpoint_series(&self) {
        self.metrics.reset_endpoint_series();
    }

    pub fn render(&self) -> Result<String> {
        self.metrics.render()
    }

    /// Render for a scrape; error-rate gauges restart after every scrape
    pub fn scrape(&self) -> Result<String> {
        let body = self.metrics.render()?;
        self.metrics.reset_error_rates();
        Ok(body)
    }

    fn set_latency_gauges(&self, labels: &[&str], stat: &EndpointStat) {
        self.metrics
            .endpoint_avg_latency
            .with_label_values(labels)
            .set(stat.avg_duration());
        self.metrics
            .endpoint_max_latency
            .with_label_values(labels)
            .set(stat.max_duration);
    }

    fn remember_router(&self, target: &EndpointTarget<'_>, top_n: usize) {
        if let Some(mut info) = self.routers.get_mut(target.router) {
            info.top_n = top_n;
            if info.namespace != target.namespace || info.ingress != target.ingress {
                // Gauges under the old labels would never be updated again
                for (_, path) in self
                    .top_paths
                    .load()
                    .iter()
                    .filter(|(router, _)| *router == target.router)
                {
                    self.metrics
                        .remove_latency_gauges(&[info.namespace.as_str(), info.ingress.as_str(), path]);
                }
                info.namespace = target.namespace.to_string();
                info.ingress = target.ingress.to_string();
            }
            return;
        }

        self.routers.insert(
            target.router.to_string(),
            RouterInfo {
                namespace: target.namespace.to_string(),
                ingress: target.ingress.to_string(),
                top_n,
            },
        );
    }
}

/// Periodically recompute the top-N set until shutdown
pub async fn run_top_paths_ticker(
    engine: Arc<MetricsEngine>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                engine.refresh_top_paths();
            }
        }
    }
    debug!("Top paths ticker stopped");
}

/// Periodically drop per-endpoint series until shutdown
pub async fn run_series_reset_ticker(
    engine: Arc<MetricsEngine>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                engine.reset_endpoint_series();
                info!("Reset per-endpoint series");
            }
        }
    }
    debug!("Series reset ticker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target<'a>() -> EndpointTarget<'a> {
        EndpointTarget {
            router: "shop-web",
            namespace: "shop",
            ingress: "web",
            kind: TargetKind::Ingress,
            app: "websecure-shop-web-0123456789abcdef@kubernetes",
        }
    }

    fn record(method: &str, status: u16, duration_ms: f64) -> AccessRecord {
        AccessRecord {
            method: method.to_string(),
            origin_status: status,
            duration_ms,
            ..Default::default()
        }
    }

    fn latency_gauges(engine: &MetricsEngine) -> Vec<String> {
        engine
            .render()
            .unwrap()
            .lines()
            .filter(|line| line.starts_with("traefik_officer_endpoint_avg_latency_seconds{"))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_endpoint_series_wait_for_top_n() {
        let engine = MetricsEngine::new().unwrap();
        engine.observe(&target(), &record("GET", 200, 100.0), "/a", 20);

        let output = engine.render().unwrap();
        assert!(output.contains("traefik_officer_requests_total{"));
        assert!(!output.contains("traefik_officer_endpoint_requests_total{"));

        assert_eq!(engine.refresh_top_paths(), 1);
        assert!(latency_gauges(&engine).is_empty());

        engine.observe(&target(), &record("GET", 200, 300.0), "/a", 20);
        let output = engine.render().unwrap();
        assert!(output.contains("traefik_officer_endpoint_requests_total{"));
        assert_eq!(latency_gauges(&engine).len(), 1);
        assert!(output.contains(
            r#"traefik_officer_endpoint_max_latency_seconds{ingress="web",namespace="shop",request_path="/a"} 0.3"#
        ));
    }

    #[test]
    fn test_refresh_prunes_dropped_paths() {
        let engine = MetricsEngine::new().unwrap();
        engine.observe(&target(), &record("GET", 200, 100.0), "/fast", 1);
        engine.refresh_top_paths();
        engine.observe(&target(), &record("GET", 200, 100.0), "/fast", 1);
        assert_eq!(latency_gauges(&engine).len(), 1);

        engine.observe(&target(), &record("GET", 200, 900.0), "/slow", 1);
        engine.refresh_top_paths();
        assert!(engine.top_paths().contains("shop-web", "/slow"));
        assert!(latency_gauges(&engine).is_empty());

        engine.observe(&target(), &record("GET", 200, 900.0), "/slow", 1);
        let gauges = latency_gauges(&engine);
        assert_eq!(gauges.len(), 1);
        assert!(gauges[0].contains(r#"request_path="/slow""#));
    }

    #[test]
    fn test_series_reset_survives_refresh() {
        let engine = MetricsEngine::new().unwrap();
        engine.observe(&target(), &record("GET", 200, 900.0), "/slow", 20);
        engine.refresh_top_paths();
        engine.observe(&target(), &record("GET", 200, 900.0), "/slow", 20);
        assert_eq!(latency_gauges(&engine).len(), 1);

        engine.reset_endpoint_series();
        engine.refresh_top_paths();
        assert!(latency_gauges(&engine).is_empty());
        assert!(engine.top_paths().contains("shop-web", "/slow"));

        engine.observe(&target(), &record("GET", 200, 900.0), "/slow", 20);
        assert_eq!(latency_gauges(&engine).len(), 1);
    }

    #[test]
    fn test_forget_router() {
        let engine = MetricsEngine::new().unwrap();
        engine.observe(&target(), &record("GET", 200, 50.0), "/a", 20);
        engine.refresh_top_paths();
        engine.observe(&target(), &record("GET", 200, 50.0), "/a", 20);
        assert_eq!(latency_gauges(&engine).len(), 1);

        engine.forget_router("shop-web");
        assert!(latency_gauges(&engine).is_empty());
        assert_eq!(engine.tracked_paths("shop-web"), 0);

        assert_eq!(engine.refresh_top_paths(), 0);
        assert!(latency_gauges(&engine).is_empty());
    }

    #[test]
    fn test_relabeled_target_drops_old_gauges() {
        let engine = MetricsEngine::new().unwrap();
        engine.observe(&target(), &record("GET", 200, 50.0), "/a", 20);
        engine.refresh_top_paths();
        engine.observe(&target(), &record("GET", 200, 50.0), "/a", 20);

        let moved = EndpointTarget {
            ingress: "web-v2",
            ..target()
        };
        engine.observe(&moved, &record("GET", 200, 50.0), "/a", 20);

        let gauges = latency_gauges(&engine);
        assert_eq!(gauges.len(), 1);
        assert!(gauges[0].contains(r#"ingress="web-v2""#));
    }

    #[test]
    fn test_scrape_resets_error_rates() {
        let engine = MetricsEngine::new().unwrap();
        engine.observe(&target(), &record("GET", 500, 10.0), "/a", 20);
        engine.refresh_top_paths();
        engine.observe(&target(), &record("GET", 404, 10.0), "/a", 20);

        let first = engine.scrape().unwrap();
        assert!(first.contains(
            r#"traefik_officer_endpoint_server_error_rate{ingress="web",namespace="shop",request_path="/a"} 0.5"#
        ));

        let second = engine.scrape().unwrap();
        assert!(!second.contains("traefik_officer_endpoint_error_rate{"));
    }

    #[test]
    fn test_reset_endpoint_series() {
        let engine = MetricsEngine::new().unwrap();
        engine.observe(&target(), &record("GET", 200, 10.0), "/a", 20);
        engine.refresh_top_paths();
        engine.observe(&target(), &record("GET", 200, 10.0), "/a", 20);

        engine.reset_endpoint_series();
        let output = engine.render().unwrap();
        assert!(!output.contains("traefik_officer_endpoint_avg_latency_seconds{"));
        assert!(!output.contains("traefik_officer_endpoint_requests_total{"));
        // Coarse metrics survive
        assert!(output.contains("traefik_officer_requests_total{"));
    }

    #[tokio::test]
    async fn test_ticker_stops_on_shutdown() {
        let engine = Arc::new(MetricsEngine::new().unwrap());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_top_paths_ticker(
            engine,
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
