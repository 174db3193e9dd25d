//! Error types for the learned optimizer.
//!
//! Two broad categories exist:
//!
//! - **Fatal** errors (shape mismatches during structured-vector
//!   reconstruction, invalid configuration, backpropagating through a
//!   detached graph): programming or configuration defects that propagate
//!   out of the driver after the partial result log has been retained.
//! - **Recoverable** numerical conditions (a non-finite held-out loss) are
//!   handled locally inside the driver by substituting a safe zero and are
//!   surfaced through the result log, never through this type.

use thiserror::Error;

/// Result type for learned-optimizer operations.
pub type LearnedOptimResult<T> = Result<T, LearnedOptimError>;

/// Errors that can occur while constructing or running the meta-optimizer.
#[derive(Debug, Error)]
pub enum LearnedOptimError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Shape mismatch between a flat vector and its structured view
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Inner-loop training error
    #[error("Training error: {0}")]
    Training(String),

    /// A parameter key does not follow the `<kind>_<layer>` naming scheme
    #[error("Unroutable parameter key {key:?}: expected a `_<layer-id>` suffix")]
    BadParamKey { key: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl LearnedOptimError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }
}
