//! scaler-registry — in-flight and failure registry for the scaler.
//!
//! Tracks every workload that is currently being scaled or whose last
//! scaling attempt failed, keyed by `(namespace, name)`. Entries live for
//! the whole process: they are created on the first scale attempt and
//! removed on success or when the workload disappears from the cluster.
//!
//! Callers go through [`Registry::claim`] (or check [`Registry::is_in_flight`])
//! before launching a new scaling attempt, which keeps at most one active
//! attempt per workload.

pub mod registry;

pub use registry::{Claim, Registry, RegistrySummary};
