//! Error types for RootNav training.

use thiserror::Error;

/// Main error type for the RootNav workspace.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or encoding error
    #[error("Image processing error: {0}")]
    Image(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dataset layout or sample error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Model error
    #[error("Model error: {0}")]
    Model(String),

    /// Tensor shapes that must agree do not
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Checkpoint exists but cannot be used
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Image(err.to_string())
    }
}

/// Specialized Result type for RootNav operations.
pub type Result<T> = std::result::Result<T, Error>;
