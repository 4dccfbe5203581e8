//! Per-layer attention views
//!
//! A forward pass reports attention per layer as `[B, H, T, T]` tensors. The
//! visualization renders one example at a time, so the layers are stacked
//! into `[L, B, H, T, T]` and then reordered batch-major:
//!
//! ```text
//! all_layer_activations[l][field]   [B, H, T, T]
//!   stack over l                 -> [L, B, H, T, T]
//!   permute (1, 0, 2, 3, 4)      -> [B, L, H, T, T]
//! ```
//!
//! There is no partial view: one layer without the field fails the whole
//! derivation.

use std::{fmt, str::FromStr};

use crate::{
    error::{MiradorError, Result},
    gateway::InferenceResult,
    value::AnyTensor,
};

/// Axis order taking `[L, B, H, T, T]` to `[B, L, H, T, T]`
pub const BATCH_MAJOR: [usize; 5] = [1, 0, 2, 3, 4];

/// Per-layer attention tensor to derive a view of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionField {
    /// Normalized attention scores, `attn_weights`
    Weights,
    /// Pre-softmax scores, `attn_logits`
    Logits,
}

impl AttentionField {
    /// Key in a layer's activation map
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Weights => "attn_weights",
            Self::Logits => "attn_logits",
        }
    }
}

impl fmt::Display for AttentionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for AttentionField {
    type Err = MiradorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "attn_weights" => Ok(Self::Weights),
            "attn_logits" => Ok(Self::Logits),
            other => Err(MiradorError::MissingField {
                location: "attention fields".to_string(),
                field: other.to_string(),
            }),
        }
    }
}

/// Stack `field` across all layers and reorder to `[B, L, H, T, T]`
///
/// # Errors
///
/// - [`MiradorError::MissingField`] if the result has no layer list or any
///   layer lacks `field`
/// - [`MiradorError::InvalidShape`] if there are no layers, a field is not a
///   4-d array, or layer shapes differ
/// - [`MiradorError::DTypeMismatch`] if layers disagree on element type
pub fn derive_view(result: &InferenceResult, field: AttentionField) -> Result<AnyTensor> {
    let layers = result.layer_activations()?;
    if layers.is_empty() {
        return Err(MiradorError::InvalidShape {
            reason: "Result has no layer activations to stack".to_string(),
        });
    }

    let per_layer = layers
        .iter()
        .enumerate()
        .map(|(l, layer)| {
            let value = layer.get(field.key()).ok_or_else(|| MiradorError::MissingField {
                location: format!("layer {l} activations"),
                field: field.key().to_string(),
            })?;
            let tensor = value.as_array().ok_or_else(|| MiradorError::InvalidShape {
                reason: format!("layer {l} {field} is {}, not an array", value.type_name()),
            })?;
            if tensor.shape().len() != 4 {
                return Err(MiradorError::InvalidShape {
                    reason: format!(
                        "layer {l} {field} has shape {:?}, expected [batch, head, time, time]",
                        tensor.shape()
                    ),
                });
            }
            Ok(tensor)
        })
        .collect::<Result<Vec<_>>>()?;

    AnyTensor::stack(&per_layer)?.permute(&BATCH_MAJOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gateway::LAYER_ACTIVATIONS,
        tensor::Tensor,
        value::{Map, Value},
    };
    use ndarray::{ArrayD, IxDyn};

    /// Layer `l` value at `[b, h, i, j]` encodes its own coordinates
    fn coded(l: usize, b: usize, h: usize, i: usize, j: usize) -> f32 {
        (l * 10_000 + b * 1000 + h * 100 + i * 10 + j) as f32
    }

    fn layer_tensor(l: usize, batch: usize, heads: usize, t: usize) -> Tensor<f32> {
        let mut data = Vec::new();
        for b in 0..batch {
            for h in 0..heads {
                for i in 0..t {
                    for j in 0..t {
                        data.push(coded(l, b, h, i, j));
                    }
                }
            }
        }
        Tensor::from_vec(vec![batch, heads, t, t], data).unwrap()
    }

    fn result_with(layers: Vec<Map>) -> InferenceResult {
        let mut result = InferenceResult::default();
        result.insert(
            LAYER_ACTIVATIONS,
            Value::List(layers.into_iter().map(Value::Map).collect()),
        );
        result
    }

    fn full_layer(l: usize) -> Map {
        let mut m = Map::new();
        m.insert("attn_weights".to_string(), layer_tensor(l, 1, 2, 3).into());
        m.insert("attn_logits".to_string(), layer_tensor(l, 1, 2, 3).map(|v| -v).into());
        m
    }

    #[test]
    fn test_view_shape_and_values() {
        let result = result_with(vec![full_layer(0), full_layer(1)]);
        let view = derive_view(&result, AttentionField::Weights).unwrap();
        assert_eq!(view.shape(), &[1, 2, 2, 3, 3]);

        let AnyTensor::F32(view) = view else {
            panic!("expected f32 view");
        };
        for l in 0..2 {
            for h in 0..2 {
                for i in 0..3 {
                    for j in 0..3 {
                        assert_eq!(view.get(&[0, l, h, i, j]), Some(coded(l, 0, h, i, j)));
                    }
                }
            }
        }
    }

    #[test]
    fn test_batch_moves_to_front() {
        let mut layers = Vec::new();
        for l in 0..3 {
            let mut m = Map::new();
            m.insert("attn_logits".to_string(), layer_tensor(l, 2, 1, 2).into());
            layers.push(m);
        }
        let view = derive_view(&result_with(layers), AttentionField::Logits).unwrap();
        assert_eq!(view.shape(), &[2, 3, 1, 2, 2]);

        let AnyTensor::F32(view) = view else {
            panic!("expected f32 view");
        };
        assert_eq!(view.get(&[1, 2, 0, 1, 0]), Some(coded(2, 1, 0, 1, 0)));
    }

    #[test]
    fn test_missing_field_is_fatal_and_per_field() {
        let mut partial = full_layer(1);
        partial.shift_remove("attn_weights");
        let result = result_with(vec![full_layer(0), partial]);

        let err = derive_view(&result, AttentionField::Weights).unwrap_err();
        assert!(matches!(
            err,
            MiradorError::MissingField { ref location, .. } if location == "layer 1 activations"
        ));
        assert!(derive_view(&result, AttentionField::Logits).is_ok());
    }

    #[test]
    fn test_ndarray_layers_accepted() {
        let mut m = Map::new();
        m.insert(
            "attn_weights".to_string(),
            ArrayD::<f64>::ones(IxDyn(&[1, 1, 2, 2])).into(),
        );
        let view = derive_view(&result_with(vec![m]), AttentionField::Weights).unwrap();
        assert_eq!(view.shape(), &[1, 1, 1, 2, 2]);
    }

    #[test]
    fn test_rejects_wrong_rank_and_empty() {
        let mut m = Map::new();
        m.insert(
            "attn_weights".to_string(),
            Tensor::from_vec(vec![2, 2], vec![0.0f32; 4]).unwrap().into(),
        );
        assert!(matches!(
            derive_view(&result_with(vec![m]), AttentionField::Weights).unwrap_err(),
            MiradorError::InvalidShape { .. }
        ));
        assert!(derive_view(&result_with(vec![]), AttentionField::Weights).is_err());
    }

    #[test]
    fn test_field_parse() {
        assert_eq!("attn_logits".parse::<AttentionField>().unwrap(), AttentionField::Logits);
        assert!("attn_values".parse::<AttentionField>().is_err());
        assert_eq!(AttentionField::Weights.to_string(), "attn_weights");
    }
}
