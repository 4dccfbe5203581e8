//! Error types for mirador
//!
//! Every failure on the request path ends up as a [`MiradorError`]. The HTTP
//! layer turns it into a 500 whose body is the error's `Display` text.

use thiserror::Error;

/// Result type alias for mirador operations
pub type Result<T> = std::result::Result<T, MiradorError>;

/// Error type for all mirador operations
#[derive(Debug, Error)]
pub enum MiradorError {
    /// A value reaching the structured encoder has no numeric/JSON form
    #[error("Object of type {type_name} is not JSON serializable")]
    UnsupportedType {
        /// Name of the offending type
        type_name: String,
    },

    /// A result or per-layer activation mapping lacks an expected entry
    #[error("{location} is missing field '{field}'")]
    MissingField {
        /// Where the field was expected, e.g. `layer 2 activations`
        location: String,
        /// Missing field name
        field: String,
    },

    /// Invalid tensor shape
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Description of the shape problem
        reason: String,
    },

    /// Data size does not match shape
    #[error("Data size {data_size} does not match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Actual data size
        data_size: usize,
        /// Requested shape
        shape: Vec<usize>,
        /// Expected size from shape
        expected: usize,
    },

    /// Tensors that must share an element type do not
    #[error("Element type mismatch: expected {expected}, found {found}")]
    DTypeMismatch {
        /// Element type of the first tensor
        expected: String,
        /// Element type that differed
        found: String,
    },

    /// Request body could not be turned into a token array
    #[error("Malformed request: {reason}")]
    MalformedRequest {
        /// What was wrong with the body
        reason: String,
    },

    /// Configuration or hyperparameter value is missing or unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Forward pass failed
    #[error("Inference failed: {0}")]
    Inference(String),

    /// The forward pass collaborator provides no spread derivation
    #[error("Spread derivation is not provided by this model")]
    SpreadUnavailable,

    /// Binary array stream could not be written or parsed
    #[error("NPY error: {reason}")]
    Npy {
        /// Description of the format problem
        reason: String,
    },

    /// JSON serialization or parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: String,
        /// Underlying socket error
        source: std::io::Error,
    },
}

impl MiradorError {
    /// Stable name of the error variant, written to the failure log as the
    /// failure type
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedType { .. } => "UnsupportedTypeError",
            Self::MissingField { .. } => "MissingFieldError",
            Self::InvalidShape { .. } => "InvalidShapeError",
            Self::DataShapeMismatch { .. } => "DataShapeMismatchError",
            Self::DTypeMismatch { .. } => "DTypeMismatchError",
            Self::MalformedRequest { .. } => "MalformedRequestError",
            Self::InvalidConfiguration(_) => "InvalidConfigurationError",
            Self::Inference(_) => "InferenceError",
            Self::SpreadUnavailable => "SpreadUnavailableError",
            Self::Npy { .. } => "NpyError",
            Self::Json(_) => "JsonError",
            Self::Io(_) => "IoError",
            Self::Bind { .. } => "BindError",
        }
    }
}
