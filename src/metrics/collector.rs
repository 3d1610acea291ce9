//! Per-endpoint request statistics
//!
//! Aggregates access records into cumulative stats keyed by
//! `(router, normalized path)`. Rows are only ever written by the processor;
//! the top-N ticker reads them concurrently.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Key for endpoint aggregation
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct EndpointKey {
    pub router: String,
    pub path: String,
}

/// Cumulative statistics for one endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointStat {
    pub total_requests: u64,
    /// Seconds
    pub total_duration: f64,
    /// Seconds
    pub max_duration: f64,
    pub error_count: u64,
    pub client_error_count: u64,
    pub server_error_count: u64,
    /// Insertion order, used to break latency ties
    pub seq: u64,
}

impl EndpointStat {
    fn new(seq: u64) -> Self {
        Self {
            total_requests: 0,
            total_duration: 0.0,
            max_duration: 0.0,
            error_count: 0,
            client_error_count: 0,
            server_error_count: 0,
            seq,
        }
    }

    fn update(&mut self, duration_secs: f64, status: u16) {
        self.total_requests += 1;
        self.total_duration += duration_secs;
        if duration_secs > self.max_duration {
            self.max_duration = duration_secs;
        }

        if status >= 500 {
            self.error_count += 1;
            self.server_error_count += 1;
        } else if status >= 400 {
            self.error_count += 1;
            self.client_error_count += 1;
        }
    }

    pub fn avg_duration(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_duration / self.total_requests as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        self.rate(self.error_count)
    }

    pub fn client_error_rate(&self) -> f64 {
        self.rate(self.client_error_count)
    }

    pub fn server_error_rate(&self) -> f64 {
        self.rate(self.server_error_count)
    }

    fn rate(&self, count: u64) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            count as f64 / self.total_requests as f64
        }
    }
}

#[derive(Clone, Default)]
pub struct EndpointStats {
    stats: Arc<DashMap<EndpointKey, EndpointStat>>,
    next_seq: Arc<AtomicU64>,
}

impl EndpointStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request and return the updated row
    pub fn record(&self, key: EndpointKey, duration_secs: f64, status: u16) -> EndpointStat {
        let mut stat = self
            .stats
            .entry(key)
            .or_insert_with(|| EndpointStat::new(self.next_seq.fetch_add(1, Ordering::Relaxed)));
        stat.update(duration_secs, status);
        stat.value().clone()
    }

    pub fn get(&self, router: &str, path: &str) -> Option<EndpointStat> {
        self.stats
            .get(&EndpointKey {
                router: router.to_string(),
                path: path.to_string(),
            })
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of every row
    pub fn snapshot(&self) -> Vec<(EndpointKey, EndpointStat)> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Number of distinct paths tracked for a router
    pub fn paths_for(&self, router: &str) -> usize {
        self.stats
            .iter()
            .filter(|entry| entry.key().router == router)
            .count()
    }

    /// Drop every row of a router; returns how many were removed
    pub fn remove_router(&self, router: &str) -> usize {
        let before = self.stats.len();
        self.stats.retain(|key, _| key.router != router);
        before.saturating_sub(self.stats.len())
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> EndpointKey {
        EndpointKey {
            router: "shop-web".to_string(),
            path: path.to_string(),
        }
    }

    #[test]
    fn test_record_accumulates() {
        let stats = EndpointStats::new();
        stats.record(key("/a"), 0.1, 200);
        stats.record(key("/a"), 0.3, 404);
        let stat = stats.record(key("/a"), 0.2, 503);

        assert_eq!(stat.total_requests, 3);
        assert!((stat.total_duration - 0.6).abs() < 1e-9);
        assert!((stat.max_duration - 0.3).abs() < 1e-9);
        assert!((stat.avg_duration() - 0.2).abs() < 1e-9);
        assert_eq!(stat.error_count, 2);
        assert_eq!(stat.client_error_count, 1);
        assert_eq!(stat.server_error_count, 1);
        assert!((stat.error_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_errors_partition_into_client_and_server() {
        let stats = EndpointStats::new();
        for status in [200, 301, 399, 400, 418, 499, 500, 502, 599] {
            let before = stats.get("shop-web", "/p").map_or(0, |s| s.error_count);
            let stat = stats.record(key("/p"), 0.01, status);

            assert!(stat.error_count - before <= 1);
            assert_eq!(stat.error_count, stat.client_error_count + stat.server_error_count);
            assert!(stat.total_requests >= stat.error_count);
        }

        let stat = stats.get("shop-web", "/p").unwrap();
        assert_eq!(stat.client_error_count, 3);
        assert_eq!(stat.server_error_count, 3);
    }

    #[test]
    fn test_insertion_order() {
        let stats = EndpointStats::new();
        stats.record(key("/first"), 0.1, 200);
        stats.record(key("/second"), 0.1, 200);
        stats.record(key("/first"), 0.1, 200);

        let first = stats.get("shop-web", "/first").unwrap();
        let second = stats.get("shop-web", "/second").unwrap();
        assert!(first.seq < second.seq);
        assert_eq!(stats.paths_for("shop-web"), 2);
        assert_eq!(stats.paths_for("other"), 0);
    }
}
