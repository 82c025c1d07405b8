//! scaler-core — shared types for the state-driven replica scaler.
//!
//! - **`types`** — the uniform `ScalingItem` workload view and annotation keys
//! - **`state`** — state definitions, priority resolution, per-item targets
//! - **`quantity`** — Kubernetes-style resource quantities and lists
//! - **`config`** — `scaler.toml` engine configuration

pub mod config;
pub mod error;
pub mod quantity;
pub mod state;
pub mod types;

pub use config::{EngineConfig, Platform, ScalingMode};
pub use error::{CoreError, CoreResult};
pub use quantity::{Quantity, ResourceList};
pub use state::{
    State, StateDefinition, StateReplicaMap, StateReplicas, find_state, prioritize,
    resolve_state, target_replicas, validate_definitions,
};
pub use types::*;
