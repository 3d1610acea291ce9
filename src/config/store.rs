//! Thread-safe registry of runtime configs
//!
//! Written by the reconciler, read on every processed line. Reads vastly
//! outnumber writes, so a single `RwLock` over the map is enough.

use super::RuntimeConfig;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Clone, Default)]
pub struct ConfigStore {
    inner: Arc<RwLock<HashMap<String, Arc<RuntimeConfig>>>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<RuntimeConfig>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Insert or replace the config under its key
    ///
    /// A config with the same rules as the stored one is not replaced, so
    /// repeated reconciliation keeps the original `last_updated`. Entries
    /// with the same owner under a different key (the target was renamed)
    /// are dropped.
    pub fn upsert(&self, config: RuntimeConfig) -> UpsertOutcome {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        map.retain(|key, existing| existing.owner != config.owner || *key == config.key);

        let outcome = match map.get(&config.key) {
            Some(existing) if existing.same_rules(&config) => return UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };

        info!(key = %config.key, owner = %config.owner, "Config {:?}", outcome);
        map.insert(config.key.clone(), Arc::new(config));
        outcome
    }

    pub fn remove(&self, key: &str) -> Option<Arc<RuntimeConfig>> {
        let removed = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);

        if removed.is_some() {
            info!(key, "Removed config");
        }
        removed
    }

    /// Remove `key` only if it was written by `owner`
    pub fn remove_owned(&self, key: &str, owner: &str) -> Option<Arc<RuntimeConfig>> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if map.get(key).is_some_and(|c| c.owner == owner) {
            info!(key, owner, "Removed config");
            map.remove(key)
        } else {
            None
        }
    }

    /// Drop every config whose owner is not in `live_owners`; returns the
    /// removed keys
    pub fn retain_owners(&self, live_owners: &HashSet<String>) -> Vec<String> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = Vec::new();

        map.retain(|key, config| {
            let keep = live_owners.contains(&config.owner);
            if !keep {
                removed.push(key.clone());
            }
            keep
        });

        for key in &removed {
            info!(key = %key, "Pruned config of deleted object");
        }
        removed
    }

    pub fn list(&self) -> Vec<Arc<RuntimeConfig>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
