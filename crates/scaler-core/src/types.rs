//! Workload types shared by every scaler crate.
//!
//! A `ScalingItem` is the uniform view of a scalable workload. Adapters
//! convert concrete resource kinds into it; the engine never sees the
//! concrete objects.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::quantity::ResourceList;

/// Label marking a workload as managed by the scaler.
pub const OPT_IN_LABEL: &str = "scaler/opt-in";

/// Annotation exempting HPA-managed workloads from scale-down and quota checks.
pub const ALLOW_AUTOSCALING_ANNOTATION: &str = "scaler/allow-autoscaling";

/// Prefix and suffix of the per-state replica annotation
/// `scaler/state-<name>-replicas`.
pub const STATE_ANNOTATION_PREFIX: &str = "scaler/state-";
pub const STATE_ANNOTATION_SUFFIX: &str = "-replicas";

/// State looked up for workloads that are not opted in.
pub const DEFAULT_STATE: &str = "default";

/// Rollout condition reason reported when a rollout stalls.
pub const PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";

/// Sentinel for "desired replicas not computed yet".
pub const UNSET_REPLICAS: i32 = -1;

/// Default rollout progress deadline, matching the Deployment default.
pub const DEFAULT_PROGRESS_DEADLINE_SECONDS: u32 = 600;

/// Build the replica annotation key for a state name.
pub fn state_annotation(state: &str) -> String {
    format!("{STATE_ANNOTATION_PREFIX}{state}{STATE_ANNOTATION_SUFFIX}")
}

/// Kind of the concrete workload behind a `ScalingItem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScalingItemType {
    Deployment,
    DeploymentConfig,
    RedisCluster,
}

impl ScalingItemType {
    pub const ALL: [ScalingItemType; 3] = [
        ScalingItemType::Deployment,
        ScalingItemType::DeploymentConfig,
        ScalingItemType::RedisCluster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingItemType::Deployment => "Deployment",
            ScalingItemType::DeploymentConfig => "DeploymentConfig",
            ScalingItemType::RedisCluster => "RedisCluster",
        }
    }
}

impl fmt::Display for ScalingItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry identity of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub namespace: String,
    pub name: String,
}

impl ItemKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Per-replica resource requests and limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub limits: ResourceList,
}

/// Uniform view of a scalable workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingItem {
    pub namespace: String,
    pub name: String,
    pub kind: ScalingItemType,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Replica count currently requested on the cluster object.
    #[serde(default)]
    pub spec_replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    /// Target computed by the engine; `UNSET_REPLICAS` until then.
    #[serde(default = "unset_replicas")]
    pub desired_replicas: i32,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default = "default_progress_deadline")]
    pub progress_deadline_seconds: u32,
    /// Latest rollout condition reason reported by the cluster.
    #[serde(default)]
    pub condition_reason: Option<String>,
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub failure_message: String,
    #[serde(default)]
    pub is_being_scaled: bool,
    /// Optimistic-concurrency token owned by the adapter.
    #[serde(default)]
    pub resource_version: u64,
}

fn unset_replicas() -> i32 {
    UNSET_REPLICAS
}

fn default_progress_deadline() -> u32 {
    DEFAULT_PROGRESS_DEADLINE_SECONDS
}

impl ScalingItem {
    /// A bare item with no labels, annotations, or replicas.
    pub fn new(kind: ScalingItemType, namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec_replicas: 0,
            ready_replicas: 0,
            desired_replicas: UNSET_REPLICAS,
            resources: ResourceRequirements::default(),
            progress_deadline_seconds: DEFAULT_PROGRESS_DEADLINE_SECONDS,
            condition_reason: None,
            failure: false,
            failure_message: String::new(),
            is_being_scaled: false,
            resource_version: 0,
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(&self.namespace, &self.name)
    }

    /// Whether the workload carries `scaler/opt-in=true`.
    pub fn is_opted_in(&self) -> bool {
        self.labels.get(OPT_IN_LABEL).map(String::as_str) == Some("true")
    }

    /// Whether the workload carries `scaler/allow-autoscaling=true`.
    pub fn allows_autoscaling(&self) -> bool {
        self.annotations
            .get(ALLOW_AUTOSCALING_ANNOTATION)
            .map(String::as_str)
            == Some("true")
    }

    /// Whether the cluster reports the rollout as stalled.
    pub fn progress_deadline_exceeded(&self) -> bool {
        self.condition_reason.as_deref() == Some(PROGRESS_DEADLINE_EXCEEDED)
    }

    /// Whether a label selector (equality terms only) matches this item.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k) == Some(v))
    }
}
