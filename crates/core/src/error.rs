//! Core error types

use thiserror::Error;

/// Core result type
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error types
#[derive(Debug, Error)]
pub enum CoreError {
    // Environment errors
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Unsupported interop: {0}")]
    UnsupportedInterop(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Shape errors
    #[error("Shape error for {name}: {reason}")]
    Shape { name: String, reason: String },

    #[error("Weight shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Parameter {name} is already sliced (rank {rank} of {tp_size})")]
    AlreadySliced {
        name: String,
        rank: usize,
        tp_size: usize,
    },

    // Weight errors
    #[error("Missing weight: {0}")]
    MissingWeight(String),

    #[error("Tensor {0} has no storage (meta tensor)")]
    NoStorage(String),

    // Graph errors
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    // Collective errors
    #[error("Collective failure: {0}")]
    CollectiveFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Build a shape error for a named tensor
    pub fn shape(name: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Shape {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether the conversion may continue by passing the model through
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoreError::MissingDependency(_))
    }

    /// Whether this is one of the shape-class failures
    pub fn is_shape_error(&self) -> bool {
        matches!(
            self,
            CoreError::Shape { .. } | CoreError::ShapeMismatch { .. }
        )
    }
}
