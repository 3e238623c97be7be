//! Error types for embedding inference operations

use thiserror::Error;

/// Result type alias for embedding operations
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error types for the embedding pipeline
#[derive(Error, Debug)]
pub enum EmbedError {
    /// Normalization profile name is not one of the known profiles
    #[error("Invalid normalization profile: {0}")]
    InvalidProfile(String),

    /// DINOv2 size tag is not one of small/base/large/giant
    #[error("Unsupported model size: {0}")]
    UnsupportedModelSize(String),

    /// Backbone weights could not be retrieved or loaded
    #[error("Model load failure: {0}")]
    ModelLoadFailure(String),

    /// Patch count disagrees with the patch grid, or arrays are not broadcastable
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend inference errors
    #[error("Inference error: {0}")]
    Inference(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed dataset content (annotations, tiles, labels)
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Network errors while fetching model files
    #[error("Network error: {0}")]
    Network(String),

    /// The run was cancelled between batches
    #[error("Inference cancelled after {0} batches")]
    Cancelled(usize),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EmbedError {
    pub fn invalid_profile<S: Into<String>>(name: S) -> Self {
        Self::InvalidProfile(name.into())
    }

    pub fn unsupported_model_size<S: Into<String>>(size: S) -> Self {
        Self::UnsupportedModelSize(size.into())
    }

    pub fn model_load<S: Into<String>>(msg: S) -> Self {
        Self::ModelLoadFailure(msg.into())
    }

    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    pub fn dataset<S: Into<String>>(msg: S) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a network error from a message and the underlying cause
    pub fn network_error<S: Into<String>, E: std::fmt::Display>(msg: S, error: E) -> Self {
        Self::Network(format!("{}: {}", msg.into(), error))
    }

    /// Create a shape mismatch error naming what was expected and what was found
    pub fn shape_mismatch<E: std::fmt::Debug, A: std::fmt::Debug>(
        what: &str,
        expected: E,
        actual: A,
    ) -> Self {
        Self::ShapeMismatch(format!(
            "{}: expected {:?}, got {:?}",
            what, expected, actual
        ))
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        Self::Io(std::io::Error::new(
            error.kind(),
            format!(
                "Failed to {} '{}': {}",
                operation,
                path.as_ref().display(),
                error
            ),
        ))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {}", rec),
            None => String::new(),
        };

        Self::InvalidConfig(format!(
            "Invalid {}: {} (valid range: {}).{}",
            parameter, value, valid_range, recommendation
        ))
    }
}
