//! Hyperparameter set
//!
//! Static description of the model's architecture and training settings.
//! Built once, never mutated, served verbatim at `/hyper.json`.

use std::path::Path;

use crate::{
    error::{MiradorError, Result},
    value::{Map, Value},
};

/// Immutable, arbitrarily nested hyperparameter mapping
#[derive(Debug, Clone, PartialEq)]
pub struct Hyperparameters {
    /// Always a `Value::Map`
    root: Value,
}

impl Hyperparameters {
    /// Wrap a mapping
    #[must_use]
    pub fn new(map: Map) -> Self {
        Self {
            root: Value::Map(map),
        }
    }

    /// Build from a JSON object
    ///
    /// # Errors
    ///
    /// Returns error if `json` is not an object
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        match Value::from(json) {
            Value::Map(map) => Ok(Self::new(map)),
            other => Err(MiradorError::InvalidConfiguration(format!(
                "Hyperparameters must be a JSON object, found {}",
                other.type_name()
            ))),
        }
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not a JSON object
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(serde_json::from_str(&text)?)
    }

    /// Demo settings for the built-in attention-only model
    #[must_use]
    pub fn demo() -> Self {
        let json = serde_json::json!({
            "n_num_tokens": 100,
            "batch_size": 16,
            "sequence_length": 19,
            "learning_rate": 0.00001,
            "grad_clip_value": 1,
            "seed": 42,
            "num_layers": 2,
            "num_heads": 4,
            "model_size": 32,
            "key_size": 8,
            "dropout_rate": 0.0,
            "vocab_size": 103,
            "pad_token": 102,
        });
        match Value::from(json) {
            Value::Map(map) => Self::new(map),
            _ => Self::new(Map::new()),
        }
    }

    /// The whole set as a value tree
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Top-level entry
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Required non-negative integer entry
    ///
    /// # Errors
    ///
    /// Returns error if the entry is missing or not a non-negative integer
    pub fn usize(&self, key: &str) -> Result<usize> {
        self.get(key)
            .and_then(Value::as_i64)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| {
                MiradorError::InvalidConfiguration(format!(
                    "Hyperparameter '{key}' must be a non-negative integer"
                ))
            })
    }

    /// Optional float entry, `default` when absent
    ///
    /// # Errors
    ///
    /// Returns error if the entry exists but is not numeric
    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| {
                MiradorError::InvalidConfiguration(format!(
                    "Hyperparameter '{key}' must be a number"
                ))
            }),
        }
    }
}
