//! scaler-quota — resource-quota admission control.
//!
//! Before any replica count is raised, the gate projects the resources the
//! workload will need at its new size and compares them with the remaining
//! headroom of the namespace's quota objects. Denials are not failures:
//! the change is simply not attempted until the next trigger.

pub mod error;
pub mod gate;

pub use error::{QuotaError, QuotaResult};
pub use gate::{
    Admission, QuotaFuture, QuotaGate, QuotaSource, QuotaStatus, is_exempt, needed_resources,
};
