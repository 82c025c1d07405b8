//! In-memory cluster — implements every source trait over plain maps.
//!
//! Backs the `scalerd simulate` command and the engine tests. Rollouts
//! complete instantly unless `set_auto_ready(false)` is used, quota usage
//! is derived from live replica counts, and write conflicts can be
//! injected to exercise the retry path.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use tracing::debug;

use scaler_core::{
    CoreError, ItemKey, ResourceList, ScalingItem, ScalingItemType, StateDefinition,
};
use scaler_quota::{QuotaFuture, QuotaSource, QuotaStatus, needed_resources};

use crate::error::{AdapterError, AdapterResult, SourceResult};
use crate::source::{AdapterSet, BoxFuture, LabelSelector, StateSource, WorkloadAdapter};

/// Called after every successful update with the stored object.
pub type UpdateHook = Arc<dyn Fn(&ScalingItem) + Send + Sync>;

/// One quota object of a fixture namespace.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaFixture {
    pub namespace: String,
    pub name: String,
    pub hard: ResourceList,
}

/// TOML description of a cluster for `MemoryCluster::from_fixture`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterFixture {
    pub definitions: Vec<StateDefinition>,
    pub cluster_states: Vec<String>,
    pub namespace_states: BTreeMap<String, Vec<String>>,
    pub quotas: Vec<QuotaFixture>,
    pub workloads: Vec<ScalingItem>,
}

impl ClusterFixture {
    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[derive(Default)]
struct Inner {
    workloads: BTreeMap<(ScalingItemType, ItemKey), ScalingItem>,
    quotas: BTreeMap<String, Vec<(String, ResourceList)>>,
    definitions: Vec<StateDefinition>,
    cluster_states: Vec<String>,
    namespace_states: BTreeMap<String, Vec<String>>,
    pending_conflicts: u32,
    history: Vec<(ItemKey, i32)>,
}

/// Thread-safe in-memory cluster.
pub struct MemoryCluster {
    inner: Mutex<Inner>,
    auto_ready: AtomicBool,
    hook: Mutex<Option<UpdateHook>>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            auto_ready: AtomicBool::new(true),
            hook: Mutex::new(None),
        })
    }

    pub fn from_fixture(fixture: ClusterFixture) -> Arc<Self> {
        let cluster = Self::new();
        {
            let mut inner = cluster.lock();
            inner.definitions = fixture.definitions;
            inner.cluster_states = fixture.cluster_states;
            inner.namespace_states = fixture.namespace_states;
            for quota in fixture.quotas {
                inner
                    .quotas
                    .entry(quota.namespace)
                    .or_default()
                    .push((quota.name, quota.hard));
            }
        }
        for workload in fixture.workloads {
            cluster.put_workload(workload);
        }
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adapters for `kinds`, all backed by this cluster.
    pub fn adapters(self: &Arc<Self>, kinds: &[ScalingItemType]) -> AdapterSet {
        kinds.iter().fold(AdapterSet::new(), |set, kind| {
            set.with(Arc::new(MemoryAdapter {
                cluster: Arc::clone(self),
                kind: *kind,
            }))
        })
    }

    // ── Setup ──────────────────────────────────────────────────────

    pub fn set_definitions(&self, definitions: Vec<StateDefinition>) {
        self.lock().definitions = definitions;
    }

    pub fn set_cluster_states(&self, names: &[&str]) {
        self.lock().cluster_states = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn set_namespace_states(&self, namespace: &str, names: &[&str]) {
        self.lock().namespace_states.insert(
            namespace.to_string(),
            names.iter().map(|n| n.to_string()).collect(),
        );
    }

    pub fn set_quota(&self, namespace: &str, name: &str, hard: ResourceList) {
        let mut inner = self.lock();
        let quotas = inner.quotas.entry(namespace.to_string()).or_default();
        quotas.retain(|(n, _)| n != name);
        quotas.push((name.to_string(), hard));
    }

    /// Insert or replace a workload as-is.
    pub fn put_workload(&self, item: ScalingItem) {
        self.lock()
            .workloads
            .insert((item.kind, item.key()), item);
    }

    pub fn delete_workload(&self, kind: ScalingItemType, key: &ItemKey) -> Option<ScalingItem> {
        self.lock().workloads.remove(&(kind, key.clone()))
    }

    pub fn workload(&self, kind: ScalingItemType, key: &ItemKey) -> Option<ScalingItem> {
        self.lock().workloads.get(&(kind, key.clone())).cloned()
    }

    pub fn workloads(&self) -> Vec<ScalingItem> {
        self.lock().workloads.values().cloned().collect()
    }

    /// Namespaces that contain at least one workload.
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .lock()
            .workloads
            .keys()
            .map(|(_, key)| key.namespace.clone())
            .collect();
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }

    /// When false, updates leave `ready_replicas` untouched.
    pub fn set_auto_ready(&self, auto_ready: bool) {
        self.auto_ready.store(auto_ready, Ordering::SeqCst);
    }

    /// Simulate the rollout catching up (or stalling).
    pub fn set_ready(&self, kind: ScalingItemType, key: &ItemKey, ready: i32) {
        if let Some(item) = self.lock().workloads.get_mut(&(kind, key.clone())) {
            item.ready_replicas = ready;
        }
    }

    pub fn set_condition(&self, kind: ScalingItemType, key: &ItemKey, reason: Option<&str>) {
        if let Some(item) = self.lock().workloads.get_mut(&(kind, key.clone())) {
            item.condition_reason = reason.map(str::to_string);
        }
    }

    /// Fail the next `count` updates with a write conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.lock().pending_conflicts = count;
    }

    pub fn on_update(&self, hook: UpdateHook) {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Every replica count written for `key`, in order.
    pub fn history(&self, key: &ItemKey) -> Vec<i32> {
        self.lock()
            .history
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, replicas)| *replicas)
            .collect()
    }

    // ── Operations behind the traits ──────────────────────────────

    fn get_item(&self, kind: ScalingItemType, namespace: &str, name: &str) -> AdapterResult<ScalingItem> {
        let key = ItemKey::new(namespace, name);
        self.lock()
            .workloads
            .get(&(kind, key.clone()))
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("{kind} {key}")))
    }

    fn update_item(&self, item: &ScalingItem) -> AdapterResult<ScalingItem> {
        let key = item.key();
        let stored = {
            let mut inner = self.lock();
            if inner.pending_conflicts > 0 {
                inner.pending_conflicts -= 1;
                return Err(AdapterError::Conflict(key.to_string()));
            }
            let stored = inner
                .workloads
                .get_mut(&(item.kind, key.clone()))
                .ok_or_else(|| AdapterError::NotFound(format!("{} {key}", item.kind)))?;
            if stored.resource_version != item.resource_version {
                return Err(AdapterError::Conflict(key.to_string()));
            }

            stored.spec_replicas = item.spec_replicas;
            if self.auto_ready.load(Ordering::SeqCst) {
                stored.ready_replicas = item.spec_replicas;
            }
            stored.resource_version += 1;
            let stored = stored.clone();
            inner.history.push((key.clone(), stored.spec_replicas));
            stored
        };
        debug!(item = %key, replicas = stored.spec_replicas, "memory cluster update");

        let hook = self
            .hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(&stored);
        }
        Ok(stored)
    }

    fn list_items(
        &self,
        kind: ScalingItemType,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Vec<ScalingItem> {
        self.lock()
            .workloads
            .iter()
            .filter(|((k, key), item)| {
                *k == kind && key.namespace == namespace && item.matches_labels(selector)
            })
            .map(|(_, item)| item.clone())
            .collect()
    }

    fn quota_status(&self, namespace: &str) -> Vec<QuotaStatus> {
        let inner = self.lock();
        let Some(quotas) = inner.quotas.get(namespace) else {
            return Vec::new();
        };

        let used = inner
            .workloads
            .values()
            .filter(|item| item.namespace == namespace)
            .fold(ResourceList::new(), |acc, item| {
                acc.add(&needed_resources(item, item.spec_replicas))
            });

        quotas
            .iter()
            .map(|(name, hard)| QuotaStatus {
                name: name.clone(),
                hard: hard.clone(),
                used: used.restrict_to(hard),
            })
            .collect()
    }
}

impl StateSource for MemoryCluster {
    fn cluster_states(&self) -> BoxFuture<'_, SourceResult<Vec<String>>> {
        let states = self.lock().cluster_states.clone();
        Box::pin(async move { Ok(states) })
    }

    fn namespace_states<'a>(
        &'a self,
        namespace: &'a str,
    ) -> BoxFuture<'a, SourceResult<Vec<String>>> {
        let states = self
            .lock()
            .namespace_states
            .get(namespace)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(states) })
    }

    fn definitions(&self) -> BoxFuture<'_, SourceResult<Vec<StateDefinition>>> {
        let definitions = self.lock().definitions.clone();
        Box::pin(async move { Ok(definitions) })
    }
}

impl QuotaSource for MemoryCluster {
    fn quotas<'a>(&'a self, namespace: &'a str) -> QuotaFuture<'a> {
        let quotas = self.quota_status(namespace);
        Box::pin(async move { Ok(quotas) })
    }
}

/// Adapter for one kind over a [`MemoryCluster`].
struct MemoryAdapter {
    cluster: Arc<MemoryCluster>,
    kind: ScalingItemType,
}

impl WorkloadAdapter for MemoryAdapter {
    fn kind(&self) -> ScalingItemType {
        self.kind
    }

    fn get<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, AdapterResult<ScalingItem>> {
        let result = self.cluster.get_item(self.kind, namespace, name);
        Box::pin(async move { result })
    }

    fn update<'a>(&'a self, item: &'a ScalingItem) -> BoxFuture<'a, AdapterResult<ScalingItem>> {
        let result = if item.kind == self.kind {
            self.cluster.update_item(item)
        } else {
            Err(AdapterError::Other(format!(
                "{} adapter cannot update {}",
                self.kind, item.kind
            )))
        };
        Box::pin(async move { result })
    }

    fn list<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> BoxFuture<'a, AdapterResult<Vec<ScalingItem>>> {
        let items = self.cluster.list_items(self.kind, namespace, selector);
        Box::pin(async move { Ok(items) })
    }
}
