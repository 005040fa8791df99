//! Conversion error types

use shardconv_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConvertError>;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Checkpoint not found at path: {0}")]
    CheckpointNotFound(String),

    #[error("Invalid checkpoint format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported data type: {0}")]
    UnsupportedDtype(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    /// The underlying core error, if any
    pub fn core(&self) -> Option<&CoreError> {
        match self {
            ConvertError::Core(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_shape_error(&self) -> bool {
        self.core().map_or(false, CoreError::is_shape_error)
    }
}
