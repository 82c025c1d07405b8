//! Quota gate error types.

use thiserror::Error;

/// Errors that can occur while evaluating quota admission.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota source error for namespace {namespace}: {message}")]
    Source { namespace: String, message: String },
}

pub type QuotaResult<T> = Result<T, QuotaError>;
