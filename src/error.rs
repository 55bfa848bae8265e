//! Error types for curated-candle.

use thiserror::Error;

/// Result type alias for curated-candle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for curated-candle.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or incompatible hyperparameters, raised at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// A checkpoint parameter could not be mapped onto the module layout.
    #[error("cannot convert parameter `{key}`: {reason}")]
    Conversion { key: String, reason: String },

    /// Tensor shapes passed to a forward call do not line up.
    #[error("dimension mismatch: {0}")]
    Shape(String),

    /// Checkpoint files could not be read.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }

    pub(crate) fn conversion(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Conversion {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
