//! Error types for scaler core parsing and configuration.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while parsing annotations, quantities, and config.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid quantity {0:?}")]
    Quantity(String),

    #[error("quantity overflow: {0}")]
    Overflow(String),

    #[error("invalid replica count {value:?} for annotation {key}")]
    Replicas { key: String, value: String },

    #[error("no replica annotation for state {state:?} on {item}")]
    MissingStateReplicas { item: String, state: String },

    #[error("duplicate state definition: {0}")]
    DuplicateState(String),

    #[error("invalid duration {0:?}")]
    Duration(String),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Config(#[from] toml::de::Error),
}
