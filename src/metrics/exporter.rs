use crate::{OfficerError, Result};
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "traefik_officer";

pub(crate) const COARSE_LABELS: &[&str] = &[
    "request_method",
    "response_code",
    "app",
    "namespace",
    "target_kind",
];
pub(crate) const ENDPOINT_LABELS: &[&str] = &[
    "namespace",
    "ingress",
    "request_path",
    "request_method",
    "response_code",
];
pub(crate) const GAUGE_LABELS: &[&str] = &["namespace", "ingress", "request_path"];

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];
const OVERHEAD_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1];

/// Every metric family exported on `/metrics`, registered on an owned
/// registry
pub struct OfficerMetrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub request_duration: HistogramVec,
    pub traefik_overhead: Histogram,
    pub endpoint_requests: IntCounterVec,
    pub endpoint_duration: HistogramVec,
    pub endpoint_avg_latency: GaugeVec,
    pub endpoint_max_latency: GaugeVec,
    pub endpoint_error_rate: GaugeVec,
    pub endpoint_client_error_rate: GaugeVec,
    pub endpoint_server_error_rate: GaugeVec,
    pub lines_total: IntCounterVec,
}

impl OfficerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Requests seen in the access log").namespace(NAMESPACE),
            COARSE_LABELS,
        )?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Request duration in seconds")
                .namespace(NAMESPACE)
                .buckets(LATENCY_BUCKETS.to_vec()),
            COARSE_LABELS,
        )?;

        let traefik_overhead = Histogram::with_opts(
            HistogramOpts::new(
                "traefik_overhead_seconds",
                "Time spent in Traefik itself, per request",
            )
            .namespace(NAMESPACE)
            .buckets(OVERHEAD_BUCKETS.to_vec()),
        )?;

        let endpoint_requests = IntCounterVec::new(
            Opts::new("endpoint_requests_total", "Requests per top-N endpoint")
                .namespace(NAMESPACE),
            ENDPOINT_LABELS,
        )?;

        let endpoint_duration = HistogramVec::new(
            HistogramOpts::new(
                "endpoint_request_duration_seconds",
                "Request duration per top-N endpoint",
            )
            .namespace(NAMESPACE)
            .buckets(LATENCY_BUCKETS.to_vec()),
            ENDPOINT_LABELS,
        )?;

        let endpoint_avg_latency = gauge(
            "endpoint_avg_latency_seconds",
            "Average latency of a top-N endpoint",
        )?;
        let endpoint_max_latency = gauge(
            "endpoint_max_latency_seconds",
            "Maximum latency of a top-N endpoint",
        )?;
        let endpoint_error_rate = gauge(
            "endpoint_error_rate",
            "Share of requests answered with status >= 400",
        )?;
        let endpoint_client_error_rate = gauge(
            "endpoint_client_error_rate",
            "Share of requests answered with status 4xx",
        )?;
        let endpoint_server_error_rate = gauge(
            "endpoint_server_error_rate",
            "Share of requests answered with status >= 500",
        )?;

        let lines_total = IntCounterVec::new(
            Opts::new("lines_total", "Log lines processed, by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(traefik_overhead.clone()))?;
        registry.register(Box::new(endpoint_requests.clone()))?;
        registry.register(Box::new(endpoint_duration.clone()))?;
        registry.register(Box::new(endpoint_avg_latency.clone()))?;
        registry.register(Box::new(endpoint_max_latency.clone()))?;
        registry.register(Box::new(endpoint_error_rate.clone()))?;
        registry.register(Box::new(endpoint_client_error_rate.clone()))?;
        registry.register(Box::new(endpoint_server_error_rate.clone()))?;
        registry.register(Box::new(lines_total.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            traefik_overhead,
            endpoint_requests,
            endpoint_duration,
            endpoint_avg_latency,
            endpoint_max_latency,
            endpoint_error_rate,
            endpoint_client_error_rate,
            endpoint_server_error_rate,
            lines_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every registered family
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;

        String::from_utf8(buffer).map_err(|e| {
            OfficerError::MetricsError(prometheus::Error::Msg(format!(
                "exposition is not UTF-8: {}",
                e
            )))
        })
    }

    pub fn reset_error_rates(&self) {
        self.endpoint_error_rate.reset();
        self.endpoint_client_error_rate.reset();
        self.endpoint_server_error_rate.reset();
    }

    /// Drop every per-endpoint latency and request series
    pub fn reset_endpoint_series(&self) {
        self.endpoint_avg_latency.reset();
        self.endpoint_max_latency.reset();
        self.endpoint_duration.reset();
        self.endpoint_requests.reset();
    }

    /// Remove the latency gauges of one endpoint; absent series are ignored
    pub fn remove_latency_gauges(&self, labels: &[&str]) {
        let _ = self.endpoint_avg_latency.remove_label_values(labels);
        let _ = self.endpoint_max_latency.remove_label_values(labels);
    }
}

fn gauge(name: &str, help: &str) -> Result<GaugeVec> {
    Ok(GaugeVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        GAUGE_LABELS,
    )?)
}
