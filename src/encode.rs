//! Response encoding
//!
//! Two independent encodings:
//!
//! - structured: a value tree through [`normalize`] to JSON text, for
//!   hyperparameters and whole inference results
//! - binary: one numeric array as an NPY stream, for attention views and other
//!   large tensors where JSON would cost size and float precision

use crate::{
    error::Result,
    normalize::normalize,
    npy,
    value::{AnyTensor, Value},
};

/// Content type of structured responses
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type of binary array responses
pub const NPY_CONTENT_TYPE: &str = "application/octet-stream";

/// Fully encoded response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedResponse {
    /// UTF-8 JSON document
    Json(String),
    /// NPY byte stream
    Npy(Vec<u8>),
}

impl EncodedResponse {
    /// MIME type for the `content-type` header
    #[must_use]
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json(_) => JSON_CONTENT_TYPE,
            Self::Npy(_) => NPY_CONTENT_TYPE,
        }
    }

    /// Body length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Json(s) => s.len(),
            Self::Npy(b) => b.len(),
        }
    }

    /// Whether the body is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Body bytes
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Json(s) => s.into_bytes(),
            Self::Npy(b) => b,
        }
    }
}

/// Encode a value tree as JSON text
///
/// # Errors
///
/// Returns [`crate::MiradorError::UnsupportedType`] if the tree holds a value
/// the normalizer cannot resolve
///
/// # Examples
///
/// ```
/// use mirador::encode::{encode_structured, EncodedResponse};
/// use mirador::Value;
///
/// let v = Value::from(serde_json::json!({"num_layers": 2}));
/// assert_eq!(
///     encode_structured(&v).unwrap(),
///     EncodedResponse::Json(r#"{"num_layers":2}"#.to_string())
/// );
/// ```
pub fn encode_structured(value: &Value) -> Result<EncodedResponse> {
    let json = normalize(value)?;
    Ok(EncodedResponse::Json(serde_json::to_string(&json)?))
}

/// Encode one array as an NPY stream held in memory
///
/// # Errors
///
/// Returns error if the NPY header cannot be written
pub fn encode_array(array: &AnyTensor) -> Result<EncodedResponse> {
    npy::to_bytes(array).map(EncodedResponse::Npy)
}
