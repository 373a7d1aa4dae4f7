//! Error types shared across the crate.

use thiserror::Error;

/// Errors that can occur while configuring, sampling or reporting a mixture model.
#[derive(Debug, Error)]
pub enum BgmmError {
    /// A configuration value is out of range or inconsistent.
    #[error("Invalid config field `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },

    /// An array or tensor does not have the expected size.
    #[error("Shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        got: usize,
    },

    /// Autodiff did not produce a gradient for the positions.
    #[error("No gradient was recorded for the sampler positions")]
    MissingGradient,

    /// Converting tensor data to host values failed.
    #[error("Tensor data conversion failed: {0}")]
    Tensor(String),

    /// A diagnostic could not be computed.
    #[error("Statistics error: {0}")]
    Stats(String),

    /// Rendering a chart failed.
    #[error("Plotting failed: {0}")]
    Plot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[cfg(feature = "csv")]
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl BgmmError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        BgmmError::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BgmmError>;
