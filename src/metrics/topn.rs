//! Rolling top-N selection of endpoints by average latency

use super::collector::{EndpointKey, EndpointStat};
use arc_swap::ArcSwap;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Per router, the paths whose per-endpoint series are projected
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopNSet {
    paths: HashMap<String, HashSet<String>>,
}

impl TopNSet {
    /// Select, for every router, the `limit_for(router)` paths with the
    /// highest average latency. Ties go to the path seen first.
    pub fn compute<F>(rows: &[(EndpointKey, EndpointStat)], limit_for: F) -> Self
    where
        F: Fn(&str) -> usize,
    {
        let mut by_router: HashMap<&str, Vec<(&str, f64, u64)>> = HashMap::new();
        for (key, stat) in rows.iter().filter(|(_, stat)| stat.total_requests > 0) {
            by_router
                .entry(key.router.as_str())
                .or_default()
                .push((key.path.as_str(), stat.avg_duration(), stat.seq));
        }

        let paths = by_router
            .into_iter()
            .map(|(router, mut candidates)| {
                candidates.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(Ordering::Equal)
                        .then(a.2.cmp(&b.2))
                });
                candidates.truncate(limit_for(router));

                let set = candidates
                    .into_iter()
                    .map(|(path, _, _)| path.to_string())
                    .collect();
                (router.to_string(), set)
            })
            .collect();

        Self { paths }
    }

    pub fn contains(&self, router: &str, path: &str) -> bool {
        self.paths.get(router).is_some_and(|set| set.contains(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.paths
            .iter()
            .flat_map(|(router, set)| set.iter().map(move |path| (router.as_str(), path.as_str())))
    }

    pub fn len(&self) -> usize {
        self.paths.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Atomically swappable `TopNSet`; readers never block the ticker
#[derive(Default)]
pub struct TopPaths {
    current: ArcSwap<TopNSet>,
}

impl TopPaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, router: &str, path: &str) -> bool {
        self.current.load().contains(router, path)
    }

    pub fn load(&self) -> Arc<TopNSet> {
        self.current.load_full()
    }

    /// Install `next` and return the set it replaced
    pub fn swap(&self, next: TopNSet) -> Arc<TopNSet> {
        self.current.swap(Arc::new(next))
    }
}
