//! scaler-engine — drives workloads toward their scaling-state targets.
//!
//! - **`catalog`** — resolves the effective state of a namespace
//! - **`scaler`** — rapid and step scaling of one workload
//! - **`reconciler`** — per-namespace cycles with batched quota admission
//! - **`sweep`** — periodic retry of failed attempts
//! - **`source`** — adapter and state-source traits the engine runs against
//! - **`memory`** — in-memory cluster implementing every source trait

pub mod catalog;
pub mod context;
pub mod error;
pub mod events;
pub mod memory;
pub mod reconciler;
pub mod scaler;
pub mod source;
pub mod sweep;

pub use catalog::StateCatalog;
pub use context::{EngineContext, Timings};
pub use error::{
    AdapterError, AdapterResult, EngineError, EngineResult, ScaleError, ScaleResult, SourceError,
    SourceResult,
};
pub use events::{Event, EventSink, EventType, RecordingEventSink, TracingEventSink};
pub use memory::{ClusterFixture, MemoryCluster};
pub use reconciler::{Decision, ItemDecision, ReconcileReport, Reconciler};
pub use scaler::{ScaleOutcome, Scaler};
pub use source::{AdapterSet, BoxFuture, LabelSelector, StateSource, WorkloadAdapter};
pub use sweep::{RectificationSweep, SweepReport};
