//! External collaborators — workload adapters and the state source.
//!
//! The engine only ever handles `ScalingItem`s. One adapter per workload
//! kind converts the concrete cluster object to and from that view.
//! Methods return boxed futures so implementations stay object-safe and
//! can be injected for testing.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use scaler_core::{ScalingItem, ScalingItemType, StateDefinition};

use crate::error::{AdapterResult, SourceResult};

/// Boxed future alias used by every source trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Equality-only label selector.
pub type LabelSelector = BTreeMap<String, String>;

/// Uniform `{get, update, list}` capability over one workload kind.
pub trait WorkloadAdapter: Send + Sync {
    fn kind(&self) -> ScalingItemType;

    /// Fetch the live object. Missing objects yield `AdapterError::NotFound`.
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, AdapterResult<ScalingItem>>;

    /// Write `item.spec_replicas` back to the cluster.
    ///
    /// A stale `resource_version` yields `AdapterError::Conflict`. Returns
    /// the object as stored after the write.
    fn update<'a>(&'a self, item: &'a ScalingItem) -> BoxFuture<'a, AdapterResult<ScalingItem>>;

    fn list<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> BoxFuture<'a, AdapterResult<Vec<ScalingItem>>>;
}

/// Adapters keyed by the kind they serve.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<ScalingItemType, Arc<dyn WorkloadAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same kind.
    pub fn register(&mut self, adapter: Arc<dyn WorkloadAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn WorkloadAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, kind: ScalingItemType) -> Option<&Arc<dyn WorkloadAdapter>> {
        self.adapters.get(&kind)
    }

    pub fn contains(&self, kind: ScalingItemType) -> bool {
        self.adapters.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Where scaling states are declared.
///
/// The selection methods return the state name of every active-state
/// object of that scope; more than one is a configuration error that the
/// catalog reports.
pub trait StateSource: Send + Sync {
    fn cluster_states(&self) -> BoxFuture<'_, SourceResult<Vec<String>>>;

    fn namespace_states<'a>(&'a self, namespace: &'a str)
    -> BoxFuture<'a, SourceResult<Vec<String>>>;

    fn definitions(&self) -> BoxFuture<'_, SourceResult<Vec<StateDefinition>>>;
}
