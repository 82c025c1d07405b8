//! Engine error types.

use std::time::Duration;

use thiserror::Error;

use scaler_core::{CoreError, ItemKey, ScalingItemType};
use scaler_quota::QuotaError;

/// Errors reported by a workload adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("workload not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency conflict; the caller should refetch and retry.
    #[error("write conflict on {0}")]
    Conflict(String),

    #[error("adapter error: {0}")]
    Other(String),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Error from an external data source (states, definitions).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct SourceError(pub String);

pub type SourceResult<T> = Result<T, SourceError>;

/// Why a scaling attempt failed. Every variant is recorded on the registry.
#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("{item} is no longer opted in; refusing to scale it to state {state:?}")]
    OptedOut { item: ItemKey, state: String },

    #[error("gave up updating {item} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { item: ItemKey, attempts: u32 },

    #[error("{item} rollout exceeded its progress deadline")]
    ProgressDeadlineExceeded { item: ItemKey },

    #[error("{item} not ready for step to {step} replicas after {waited:?}")]
    StepTimeout {
        item: ItemKey,
        step: i32,
        waited: Duration,
    },

    #[error("no adapter registered for {0}")]
    NoAdapter(ScalingItemType),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("scaling task aborted: {0}")]
    Task(String),
}

pub type ScaleResult<T> = Result<T, ScaleError>;

/// Errors that abort a whole reconcile cycle or sweep entry.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Nothing to do this cycle: no definitions or no active state.
    #[error("no scaling state found: {0}")]
    NotFound(String),

    /// More than one active-state object of one scope; merging is unsupported.
    #[error("found {count} {scope} scaling state objects, expected at most one")]
    TooMany { scope: &'static str, count: usize },

    #[error("state source error: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("no adapter registered for {0}")]
    NoAdapter(ScalingItemType),
}

pub type EngineResult<T> = Result<T, EngineError>;
