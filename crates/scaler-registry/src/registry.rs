//! Registry — the in-flight and failure store ("deny list").
//!
//! One `Mutex<HashMap<ItemKey, ScalingItem>>` guards every read, write,
//! and snapshot. The lock is only held for a single map operation, never
//! across an await point, so a slow workload never blocks another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

use scaler_core::{ItemKey, ScalingItem};

/// Result of [`Registry::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// No attempt was running; the caller now owns the scaling attempt.
    Claimed,
    /// An attempt is already running; its target was updated.
    InFlight,
    /// The workload is parked in failure; its target was updated and the
    /// rectification sweep owns the retry.
    Failed,
}

/// Entry counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub entries: usize,
    pub scaling: usize,
    pub failed: usize,
}

/// Concurrency-safe store of workloads that are scaling or parked in failure.
///
/// Cloning is cheap and every clone shares the same entries.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<Mutex<HashMap<ItemKey, ScalingItem>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ItemKey, ScalingItem>> {
        // A panicking holder cannot leave a half-written entry behind.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the entry for `item`.
    ///
    /// `upsert` and [`Registry::claim`] are the only writers of
    /// `desired_replicas`, both under the lock, so the stored value is
    /// always the latest one any caller intended. The stored snapshot keeps
    /// `item.is_being_scaled`.
    pub fn upsert(
        &self,
        item: &ScalingItem,
        failure: bool,
        failure_message: impl Into<String>,
        desired_replicas: i32,
    ) {
        let mut entry = item.clone();
        entry.failure = failure;
        entry.failure_message = failure_message.into();
        entry.desired_replicas = desired_replicas;

        let key = entry.key();
        let replaced = self.lock().insert(key.clone(), entry).is_some();
        debug!(item = %key, failure, desired_replicas, replaced, "registry upsert");
    }

    /// Change status flags of an existing entry in place.
    ///
    /// Returns the updated snapshot, or `None` when no entry exists.
    /// Changes to `desired_replicas` made by `f` are discarded.
    pub fn update<F>(&self, key: &ItemKey, f: F) -> Option<ScalingItem>
    where
        F: FnOnce(&mut ScalingItem),
    {
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        let desired = entry.desired_replicas;
        f(entry);
        entry.desired_replicas = desired;
        Some(entry.clone())
    }

    /// Atomically claim the scaling attempt for `item`.
    ///
    /// When an attempt is running or the workload is failed, only the
    /// stored target changes, so the running step loop chases it. Otherwise
    /// the entry is replaced with one marked `is_being_scaled`.
    pub fn claim(&self, item: &ScalingItem, desired_replicas: i32) -> Claim {
        let key = item.key();
        let mut entries = self.lock();

        if let Some(entry) = entries.get_mut(&key) {
            if entry.is_being_scaled || entry.failure {
                entry.desired_replicas = desired_replicas;
                let claim = if entry.is_being_scaled {
                    Claim::InFlight
                } else {
                    Claim::Failed
                };
                debug!(item = %key, desired_replicas, ?claim, "registry target refreshed");
                return claim;
            }
        }

        let mut entry = item.clone();
        entry.failure = false;
        entry.failure_message.clear();
        entry.is_being_scaled = true;
        entry.desired_replicas = desired_replicas;
        entries.insert(key.clone(), entry);
        debug!(item = %key, desired_replicas, "registry claim");
        Claim::Claimed
    }

    /// Finish a successful attempt that reached `reached` replicas.
    ///
    /// The entry is removed when its target is `reached`. If a newer target
    /// arrived meanwhile, the flags are cleared and the entry kept. Returns
    /// whether the entry was removed.
    pub fn settle(&self, key: &ItemKey, reached: i32) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if entry.desired_replicas == reached {
            entries.remove(key);
            debug!(item = %key, reached, "registry entry settled");
            return true;
        }
        entry.failure = false;
        entry.failure_message.clear();
        entry.is_being_scaled = false;
        debug!(item = %key, reached, desired = entry.desired_replicas, "registry entry cleared with newer target");
        false
    }

    /// End an attempt without success or failure (e.g. quota denial).
    ///
    /// Failed entries stay for the sweep; others are dropped.
    pub fn release(&self, key: &ItemKey) {
        let mut entries = self.lock();
        let failed = match entries.get_mut(key) {
            Some(entry) => {
                entry.is_being_scaled = false;
                entry.failure
            }
            None => return,
        };
        if !failed {
            entries.remove(key);
        }
    }

    pub fn get(&self, key: &ItemKey) -> Option<ScalingItem> {
        self.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &ItemKey) -> Option<ScalingItem> {
        let removed = self.lock().remove(key);
        if removed.is_some() {
            debug!(item = %key, "registry entry removed");
        }
        removed
    }

    /// Whether a scaling attempt is running for `key`.
    pub fn is_in_flight(&self, key: &ItemKey) -> bool {
        self.lock().get(key).is_some_and(|e| e.is_being_scaled)
    }

    /// Whether `key` is parked in failure.
    pub fn is_failed(&self, key: &ItemKey) -> bool {
        self.lock().get(key).is_some_and(|e| e.failure)
    }

    /// Snapshot of every failed entry.
    ///
    /// The entries are copied under the lock and returned by value, so the
    /// caller can iterate while other tasks keep mutating the registry.
    pub fn failures(&self) -> Vec<ScalingItem> {
        let mut failed: Vec<ScalingItem> = self
            .lock()
            .values()
            .filter(|e| e.failure)
            .cloned()
            .collect();
        failed.sort_by_key(ScalingItem::key);
        failed
    }

    /// Snapshot of every entry, ordered by key.
    pub fn snapshot(&self) -> Vec<ScalingItem> {
        let mut all: Vec<ScalingItem> = self.lock().values().cloned().collect();
        all.sort_by_key(ScalingItem::key);
        all
    }

    pub fn summary(&self) -> RegistrySummary {
        let entries = self.lock();
        RegistrySummary {
            entries: entries.len(),
            scaling: entries.values().filter(|e| e.is_being_scaled).count(),
            failed: entries.values().filter(|e| e.failure).count(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scaler_core::ScalingItemType;

    fn item(ns: &str, name: &str) -> ScalingItem {
        let mut item = ScalingItem::new(ScalingItemType::Deployment, ns, name);
        item.spec_replicas = 2;
        item
    }

    #[test]
    fn upsert_is_unique_per_key() {
        let registry = Registry::new();
        let api = item("shop", "api");

        registry.upsert(&api, false, "", 3);
        registry.upsert(&api, true, "quota exceeded", 5);

        assert_eq!(registry.len(), 1);
        let entry = registry.get(&api.key()).unwrap();
        assert!(entry.failure);
        assert_eq!(entry.failure_message, "quota exceeded");
        assert_eq!(entry.desired_replicas, 5);
    }

    #[test]
    fn keys_are_namespaced() {
        let registry = Registry::new();
        registry.upsert(&item("shop", "api"), false, "", 1);
        registry.upsert(&item("billing", "api"), false, "", 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn get_and_remove() {
        let registry = Registry::new();
        let api = item("shop", "api");
        assert!(registry.get(&api.key()).is_none());

        registry.upsert(&api, false, "", 4);
        assert!(registry.get(&api.key()).is_some());

        assert!(registry.remove(&api.key()).is_some());
        assert!(registry.remove(&api.key()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn update_keeps_desired_replicas() {
        let registry = Registry::new();
        let api = item("shop", "api");
        registry.upsert(&api, false, "", 6);

        let updated = registry
            .update(&api.key(), |e| {
                e.is_being_scaled = true;
                e.desired_replicas = 99;
            })
            .unwrap();
        assert!(updated.is_being_scaled);
        assert_eq!(updated.desired_replicas, 6);
        assert!(registry.is_in_flight(&api.key()));
    }

    #[test]
    fn update_missing_entry_is_none() {
        let registry = Registry::new();
        assert!(registry
            .update(&ItemKey::new("shop", "api"), |e| e.failure = true)
            .is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn claim_is_exclusive() {
        let registry = Registry::new();
        let api = item("shop", "api");

        assert_eq!(registry.claim(&api, 4), Claim::Claimed);
        assert!(registry.is_in_flight(&api.key()));

        assert_eq!(registry.claim(&api, 7), Claim::InFlight);
        assert_eq!(registry.get(&api.key()).unwrap().desired_replicas, 7);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn claim_defers_failed_entries() {
        let registry = Registry::new();
        let api = item("shop", "api");
        registry.upsert(&api, true, "boom", 3);

        assert_eq!(registry.claim(&api, 5), Claim::Failed);
        let entry = registry.get(&api.key()).unwrap();
        assert!(entry.failure);
        assert!(!entry.is_being_scaled);
        assert_eq!(entry.desired_replicas, 5);
    }

    #[test]
    fn claim_replaces_settled_entry() {
        let registry = Registry::new();
        let api = item("shop", "api");
        registry.upsert(&api, false, "", 3);

        assert_eq!(registry.claim(&api, 5), Claim::Claimed);
        assert!(registry.is_in_flight(&api.key()));
    }

    #[test]
    fn settle_removes_when_target_reached() {
        let registry = Registry::new();
        let api = item("shop", "api");
        registry.claim(&api, 4);

        assert!(registry.settle(&api.key(), 4));
        assert!(registry.is_empty());
    }

    #[test]
    fn settle_keeps_newer_target() {
        let registry = Registry::new();
        let api = item("shop", "api");
        registry.claim(&api, 4);
        registry.claim(&api, 6);

        assert!(!registry.settle(&api.key(), 4));
        let entry = registry.get(&api.key()).unwrap();
        assert!(!entry.is_being_scaled);
        assert_eq!(entry.desired_replicas, 6);
    }

    #[test]
    fn release_keeps_only_failed_entries() {
        let registry = Registry::new();
        let api = item("shop", "api");
        let web = item("shop", "web");
        registry.claim(&api, 4);
        registry.upsert(&web, true, "boom", 2);
        registry.update(&web.key(), |e| e.is_being_scaled = true);

        registry.release(&api.key());
        registry.release(&web.key());

        assert!(registry.get(&api.key()).is_none());
        let web = registry.get(&web.key()).unwrap();
        assert!(web.failure);
        assert!(!web.is_being_scaled);
    }

    #[test]
    fn failures_only_lists_failed_entries() {
        let registry = Registry::new();
        registry.upsert(&item("shop", "api"), true, "boom", 3);
        registry.upsert(&item("shop", "web"), false, "", 3);
        registry.upsert(&item("billing", "worker"), true, "boom", 1);

        let failed = registry.failures();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].key(), ItemKey::new("billing", "worker"));
        assert!(registry.is_failed(&ItemKey::new("shop", "api")));
        assert!(!registry.is_failed(&ItemKey::new("shop", "web")));

        let summary = registry.summary();
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.failed, 2);
    }

    #[test]
    fn failure_snapshot_survives_concurrent_removal() {
        let registry = Registry::new();
        registry.upsert(&item("shop", "api"), true, "boom", 3);
        registry.upsert(&item("shop", "web"), true, "boom", 3);

        let mut seen = 0;
        for entry in registry.failures() {
            registry.remove(&entry.key());
            seen += 1;
        }
        assert_eq!(seen, 2);
        assert!(registry.failures().is_empty());
    }

    #[tokio::test]
    async fn concurrent_upserts_keep_one_entry() {
        let registry = Registry::new();
        let mut handles = Vec::new();

        for desired in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.upsert(&item("shop", "api"), false, "", desired);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.len(), 1);
        let desired = registry.get(&ItemKey::new("shop", "api")).unwrap().desired_replicas;
        assert!((0..32).contains(&desired));
    }
}
