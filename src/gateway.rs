//! Inference gateway
//!
//! Wraps a model's forward pass together with its parameters and a fixed
//! random seed, so every derivation path calls the same `run(inputs)`.
//!
//! The gateway does no locking of its own. Whether concurrent requests are
//! safe depends on the forward pass: `ForwardPass::apply` takes `&self` and
//! `&Params`, so any interior mutability inside a model is the model's own
//! business to synchronize.

use std::marker::PhantomData;

use serde_json::Value as Json;

use crate::{
    error::{MiradorError, Result},
    tensor::Tensor,
    value::{AnyTensor, Map, Value},
};

/// Key of the per-layer activation list in an inference result
pub const LAYER_ACTIVATIONS: &str = "all_layer_activations";

/// Mapping produced by one forward pass
///
/// Contains at least [`LAYER_ACTIVATIONS`], a list of per-layer maps. Created
/// fresh for every request and owned by it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceResult(Map);

impl InferenceResult {
    /// Wrap a result mapping
    #[must_use]
    pub fn new(map: Map) -> Self {
        Self(map)
    }

    /// Top-level entry
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert or replace a top-level entry
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Per-layer activation maps, in layer order
    ///
    /// # Errors
    ///
    /// Returns error if the entry is missing or is not a list
    pub fn layer_activations(&self) -> Result<&[Value]> {
        let entry = self.0.get(LAYER_ACTIVATIONS).ok_or_else(|| MiradorError::MissingField {
            location: "inference result".to_string(),
            field: LAYER_ACTIVATIONS.to_string(),
        })?;
        entry.as_list().ok_or_else(|| MiradorError::InvalidShape {
            reason: format!("'{LAYER_ACTIVATIONS}' must be a list, found {}", entry.type_name()),
        })
    }

    /// Borrow as a value tree for the structured encoder
    #[must_use]
    pub fn as_map(&self) -> &Map {
        &self.0
    }

    /// Convert into a value tree
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Map(self.0)
    }
}

impl From<Map> for InferenceResult {
    fn from(map: Map) -> Self {
        Self(map)
    }
}

/// A model's forward pass
///
/// Implementors receive the model parameters, the gateway's seed and a token
/// array of shape `[T]` or `[B, T]`.
pub trait ForwardPass: Send + Sync + 'static {
    /// Model parameters the pass reads
    type Params: Send + Sync + 'static;

    /// Run the model
    ///
    /// # Errors
    ///
    /// Any failure of the model; the gateway propagates it unchanged
    fn apply(&self, params: &Self::Params, seed: u64, tokens: &Tensor<i32>)
        -> Result<InferenceResult>;

    /// Model-specific spread derivation served at `/results_spread.npy`
    ///
    /// The default has no derivation to offer.
    ///
    /// # Errors
    ///
    /// [`MiradorError::SpreadUnavailable`] unless overridden
    fn spread(&self, params: &Self::Params, seed: u64, tokens: &Tensor<i32>) -> Result<AnyTensor> {
        let _ = (params, seed, tokens);
        Err(MiradorError::SpreadUnavailable)
    }
}

/// Adapter turning a plain function or closure into a [`ForwardPass`]
pub struct FnForward<F, P> {
    f: F,
    _params: PhantomData<fn(&P)>,
}

/// Wrap `f(params, seed, tokens)` as a forward pass
///
/// # Examples
///
/// ```
/// use mirador::gateway::{forward_fn, InferenceGateway, InferenceResult};
///
/// let forward = forward_fn(|_params: &(), _seed, _tokens| Ok(InferenceResult::default()));
/// let gateway = InferenceGateway::new(forward, (), 42);
/// assert!(gateway.run(&serde_json::json!([1, 2, 3])).is_ok());
/// ```
pub fn forward_fn<F, P>(f: F) -> FnForward<F, P>
where
    F: Fn(&P, u64, &Tensor<i32>) -> Result<InferenceResult> + Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    FnForward {
        f,
        _params: PhantomData,
    }
}

impl<F, P> ForwardPass for FnForward<F, P>
where
    F: Fn(&P, u64, &Tensor<i32>) -> Result<InferenceResult> + Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    type Params = P;

    fn apply(&self, params: &P, seed: u64, tokens: &Tensor<i32>) -> Result<InferenceResult> {
        (self.f)(params, seed, tokens)
    }
}

/// Object-safe view of a gateway, shared by the HTTP handlers
pub trait Inference: Send + Sync {
    /// Convert the request body to tokens and run the forward pass
    ///
    /// # Errors
    ///
    /// Malformed input or any model failure
    fn run(&self, inputs: &Json) -> Result<InferenceResult>;

    /// Convert the request body to tokens and run the spread derivation
    ///
    /// # Errors
    ///
    /// Malformed input, [`MiradorError::SpreadUnavailable`], or any model failure
    fn spread(&self, inputs: &Json) -> Result<AnyTensor>;
}

/// Forward pass bound to fixed parameters and a fixed seed
pub struct InferenceGateway<F: ForwardPass> {
    forward: F,
    params: F::Params,
    seed: u64,
}

impl<F: ForwardPass> InferenceGateway<F> {
    /// Bind a forward pass to its parameters and seed
    #[must_use]
    pub fn new(forward: F, params: F::Params, seed: u64) -> Self {
        Self {
            forward,
            params,
            seed,
        }
    }

    /// Seed passed to every invocation
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Run on an already converted token array
    ///
    /// # Errors
    ///
    /// Any model failure
    pub fn run_tokens(&self, tokens: &Tensor<i32>) -> Result<InferenceResult> {
        self.forward.apply(&self.params, self.seed, tokens)
    }

    /// Run on a JSON array of token ids
    ///
    /// # Errors
    ///
    /// Malformed input or any model failure
    pub fn run(&self, inputs: &Json) -> Result<InferenceResult> {
        self.run_tokens(&tokens_from_json(inputs)?)
    }
}

impl<F: ForwardPass> Inference for InferenceGateway<F> {
    fn run(&self, inputs: &Json) -> Result<InferenceResult> {
        InferenceGateway::run(self, inputs)
    }

    fn spread(&self, inputs: &Json) -> Result<AnyTensor> {
        let tokens = tokens_from_json(inputs)?;
        self.forward.spread(&self.params, self.seed, &tokens)
    }
}

/// Convert a JSON array (nested to any depth) of token ids into an `i32`
/// tensor whose shape follows the nesting
///
/// # Errors
///
/// Returns [`MiradorError::MalformedRequest`] for `null`, ragged nesting, or
/// leaves that are not `i32` integers
///
/// # Examples
///
/// ```
/// use mirador::gateway::tokens_from_json;
///
/// let t = tokens_from_json(&serde_json::json!([[5, 6, 7]])).unwrap();
/// assert_eq!(t.shape(), &[1, 3]);
/// ```
pub fn tokens_from_json(inputs: &Json) -> Result<Tensor<i32>> {
    if inputs.is_null() {
        return Err(malformed("Request body is empty, expected a JSON array of token ids"));
    }

    let mut shape = Vec::new();
    let mut cursor = inputs;
    while let Json::Array(items) = cursor {
        shape.push(items.len());
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }

    let mut data = Vec::with_capacity(shape.iter().product());
    flatten(inputs, &shape, &mut data)?;
    Tensor::from_vec(shape, data)
}

fn flatten(value: &Json, shape: &[usize], out: &mut Vec<i32>) -> Result<()> {
    match (value, shape.split_first()) {
        (Json::Array(items), Some((&len, rest))) if items.len() == len => {
            for item in items {
                flatten(item, rest, out)?;
            }
            Ok(())
        },
        (Json::Array(items), Some((&len, _))) => Err(malformed(format!(
            "Ragged token array: expected {len} entries, found {}",
            items.len()
        ))),
        (Json::Number(n), None) => {
            let id = n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| malformed(format!("Token id {n} is not a 32-bit integer")))?;
            out.push(id);
            Ok(())
        },
        (other, _) => Err(malformed(format!("Unexpected token entry {other}"))),
    }
}

fn malformed(reason: impl Into<String>) -> MiradorError {
    MiradorError::MalformedRequest {
        reason: reason.into(),
    }
}
