//! Numeric normalization
//!
//! Turns a [`Value`] tree into builtin JSON. Dispatch is over the closed set
//! of numeric leaves:
//!
//! | Leaf | Rule |
//! |------|------|
//! | `Int` / `UInt` | JSON integer |
//! | `Float` | JSON float, `null` if not finite |
//! | `Tensor` | nested lists, row-major, every axis expanded |
//! | `NdArray` | same as `Tensor` |
//!
//! Strings, booleans, lists and maps pass through. An [`Value::Opaque`] leaf
//! fails with [`MiradorError::UnsupportedType`]. Adding a numeric backend
//! means adding a `Value` variant and a row here.

use serde_json::{Map as JsonMap, Number, Value as Json};

use crate::{
    error::{MiradorError, Result},
    tensor::Element,
    value::{each_dtype, AnyNdArray, AnyTensor, Value},
};

/// Normalize a value tree into builtin JSON
///
/// # Errors
///
/// Returns [`MiradorError::UnsupportedType`] for the first opaque leaf found
///
/// # Examples
///
/// ```
/// use mirador::{normalize::normalize, Tensor, Value};
///
/// let t = Tensor::from_vec(vec![2, 3], vec![1i32, 2, 3, 4, 5, 6]).unwrap();
/// let json = normalize(&Value::from(t)).unwrap();
/// assert_eq!(json, serde_json::json!([[1, 2, 3], [4, 5, 6]]));
/// ```
pub fn normalize(value: &Value) -> Result<Json> {
    match value {
        Value::Null => Ok(Json::Null),
        Value::Bool(b) => Ok(Json::Bool(*b)),
        Value::Str(s) => Ok(Json::String(s.clone())),
        Value::Int(i) => Ok(Json::from(*i)),
        Value::UInt(u) => Ok(Json::from(*u)),
        Value::Float(f) => Ok(Number::from_f64(*f).map_or(Json::Null, Json::Number)),
        Value::Tensor(t) => Ok(tensor_to_json(t)),
        Value::NdArray(a) => Ok(ndarray_to_json(a)),
        Value::List(items) => items
            .iter()
            .map(normalize)
            .collect::<Result<Vec<_>>>()
            .map(Json::Array),
        Value::Map(map) => {
            let mut out = JsonMap::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), normalize(item)?);
            }
            Ok(Json::Object(out))
        },
        Value::Opaque { type_name } => Err(MiradorError::UnsupportedType {
            type_name: type_name.clone(),
        }),
    }
}

/// Nested JSON lists for a model-backend tensor
#[must_use]
pub fn tensor_to_json(tensor: &AnyTensor) -> Json {
    each_dtype!(AnyTensor, tensor, t => nest(t.shape(), t.data()))
}

/// Nested JSON lists for an `ndarray` array
#[must_use]
pub fn ndarray_to_json(array: &AnyNdArray) -> Json {
    each_dtype!(AnyNdArray, array, a => match a.as_slice() {
        Some(data) => nest(a.shape(), data),
        None => nest(a.shape(), &a.iter().copied().collect::<Vec<_>>()),
    })
}

fn nest<T: Element>(shape: &[usize], data: &[T]) -> Json {
    match shape.split_first() {
        None => data.first().map_or(Json::Null, |v| v.to_json()),
        Some((&len, rest)) => {
            let stride: usize = rest.iter().product();
            Json::Array(
                (0..len)
                    .map(|i| nest(rest, &data[i * stride..(i + 1) * stride]))
                    .collect(),
            )
        },
    }
}
