//! Values flowing between the model and the response encoders
//!
//! Results and hyperparameters are trees of [`Value`]. Numeric leaves come in
//! a closed set of shapes: builtin integers and floats, arrays from the
//! crate's own [`Tensor`] backend, and arrays from the `ndarray` backend.
//! Anything else a model hands back is an [`Value::Opaque`] leaf, which the
//! structured encoder refuses.

use half::f16;
use indexmap::IndexMap;
use ndarray::ArrayD;

use crate::{
    error::{MiradorError, Result},
    tensor::{DType, Element, Tensor},
};

/// Ordered string-keyed mapping
pub type Map = IndexMap<String, Value>;

/// Node of a result or hyperparameter tree
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON null
    Null,
    /// Boolean
    Bool(bool),
    /// String
    Str(String),
    /// Fixed-width signed integer
    Int(i64),
    /// Unsigned integer too large for `Int`
    UInt(u64),
    /// Floating point
    Float(f64),
    /// Array from the model-internal tensor backend
    Tensor(AnyTensor),
    /// Array from the `ndarray` backend
    NdArray(AnyNdArray),
    /// Ordered sequence
    List(Vec<Value>),
    /// Ordered string-keyed mapping
    Map(Map),
    /// Model-internal object without a numeric or JSON representation
    Opaque {
        /// Type name reported in the encoder error
        type_name: String,
    },
}

impl Value {
    /// Opaque leaf naming the type it stands for
    #[must_use]
    pub fn opaque(type_name: impl Into<String>) -> Self {
        Self::Opaque {
            type_name: type_name.into(),
        }
    }

    /// Mapping entry, if this is a map containing `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Elements, if this is a list
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Integer view of a numeric scalar, if it fits in `i64`
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Int(v) => Some(v),
            Self::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Float view of a numeric scalar
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Int(v) => Some(v as f64),
            Self::UInt(v) => Some(v as f64),
            Self::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Array view of a tensor leaf from either backend
    #[must_use]
    pub fn as_array(&self) -> Option<AnyTensor> {
        match self {
            Self::Tensor(t) => Some(t.clone()),
            Self::NdArray(a) => Some(AnyTensor::from(a)),
            _ => None,
        }
    }

    /// Short description of the variant, used in error messages
    #[must_use]
    pub fn type_name(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(_) => "bool".to_string(),
            Self::Str(_) => "str".to_string(),
            Self::Int(_) | Self::UInt(_) => "int".to_string(),
            Self::Float(_) => "float".to_string(),
            Self::Tensor(t) => format!("Tensor<{}>", t.dtype()),
            Self::NdArray(a) => format!("ArrayD<{}>", a.dtype()),
            Self::List(_) => "list".to_string(),
            Self::Map(_) => "map".to_string(),
            Self::Opaque { type_name } => type_name.clone(),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::UInt(u)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            },
            serde_json::Value::String(s) => Self::Str(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from).collect())
            },
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            },
        }
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Self::Map(map)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Tensor of any supported element type
#[derive(Debug, Clone, PartialEq)]
pub enum AnyTensor {
    /// Half precision
    F16(Tensor<f16>),
    /// 32-bit float
    F32(Tensor<f32>),
    /// 64-bit float
    F64(Tensor<f64>),
    /// 32-bit signed
    I32(Tensor<i32>),
    /// 64-bit signed
    I64(Tensor<i64>),
    /// 8-bit unsigned
    U8(Tensor<u8>),
    /// 32-bit unsigned
    U32(Tensor<u32>),
}

/// `ndarray` array of any supported element type
#[derive(Debug, Clone, PartialEq)]
pub enum AnyNdArray {
    /// Half precision
    F16(ArrayD<f16>),
    /// 32-bit float
    F32(ArrayD<f32>),
    /// 64-bit float
    F64(ArrayD<f64>),
    /// 32-bit signed
    I32(ArrayD<i32>),
    /// 64-bit signed
    I64(ArrayD<i64>),
    /// 8-bit unsigned
    U8(ArrayD<u8>),
    /// 32-bit unsigned
    U32(ArrayD<u32>),
}

/// Run `$body` with `$t` bound to the inner typed array of either enum
macro_rules! each_dtype {
    ($kind:ident, $value:expr, $t:ident => $body:expr) => {
        match $value {
            $kind::F16($t) => $body,
            $kind::F32($t) => $body,
            $kind::F64($t) => $body,
            $kind::I32($t) => $body,
            $kind::I64($t) => $body,
            $kind::U8($t) => $body,
            $kind::U32($t) => $body,
        }
    };
}

pub(crate) use each_dtype;

macro_rules! any_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Tensor<$t>> for AnyTensor {
                fn from(t: Tensor<$t>) -> Self {
                    Self::$variant(t)
                }
            }

            impl From<Tensor<$t>> for Value {
                fn from(t: Tensor<$t>) -> Self {
                    Self::Tensor(AnyTensor::$variant(t))
                }
            }

            impl From<ArrayD<$t>> for AnyNdArray {
                fn from(a: ArrayD<$t>) -> Self {
                    Self::$variant(a)
                }
            }

            impl From<ArrayD<$t>> for Value {
                fn from(a: ArrayD<$t>) -> Self {
                    Self::NdArray(AnyNdArray::$variant(a))
                }
            }
        )*
    };
}

any_from!(
    f16 => F16,
    f32 => F32,
    f64 => F64,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u32 => U32,
);

impl AnyTensor {
    /// Element type
    #[must_use]
    pub fn dtype(&self) -> DType {
        each_dtype!(AnyTensor, self, t => t.dtype())
    }

    /// Shape
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        each_dtype!(AnyTensor, self, t => t.shape())
    }

    /// Reorder axes, see [`Tensor::permute`]
    ///
    /// # Errors
    ///
    /// Returns `Err` if `axes` is not a permutation of the tensor's axes
    pub fn permute(&self, axes: &[usize]) -> Result<Self> {
        Ok(each_dtype!(AnyTensor, self, t => t.permute(axes)?.into()))
    }

    /// Stack equally typed and shaped tensors along a new leading axis
    ///
    /// # Errors
    ///
    /// Returns `Err` if the list is empty, or element types or shapes differ
    pub fn stack(tensors: &[Self]) -> Result<Self> {
        let first = tensors.first().ok_or_else(|| MiradorError::InvalidShape {
            reason: "Cannot stack an empty list of tensors".to_string(),
        })?;
        each_dtype!(AnyTensor, first, t => stack_as(t, tensors))
    }

    /// Little-endian row-major element bytes
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        each_dtype!(AnyTensor, self, t => {
            let mut out = Vec::with_capacity(t.size() * t.dtype().size());
            for &v in t.data() {
                v.write_le(&mut out);
            }
            out
        })
    }
}

/// Stack `tensors` as `Tensor<T>`, the element type of `_first`
fn stack_as<T: Element>(_first: &Tensor<T>, tensors: &[AnyTensor]) -> Result<AnyTensor>
where
    AnyTensor: TypedTensor<T> + From<Tensor<T>>,
{
    let typed = tensors
        .iter()
        .map(|t| {
            TypedTensor::<T>::typed(t)
                .cloned()
                .ok_or_else(|| MiradorError::DTypeMismatch {
                    expected: T::DTYPE.to_string(),
                    found: t.dtype().to_string(),
                })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&typed)?.into())
}

/// Typed access to the variant of an [`AnyTensor`]
pub trait TypedTensor<T: Element> {
    /// Inner tensor if the element type is `T`
    fn typed(&self) -> Option<&Tensor<T>>;
}

macro_rules! typed_tensor {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl TypedTensor<$t> for AnyTensor {
                fn typed(&self) -> Option<&Tensor<$t>> {
                    match self {
                        Self::$variant(t) => Some(t),
                        _ => None,
                    }
                }
            }
        )*
    };
}

typed_tensor!(
    f16 => F16,
    f32 => F32,
    f64 => F64,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u32 => U32,
);

impl AnyNdArray {
    /// Element type
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F16(_) => DType::F16,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
            Self::I32(_) => DType::I32,
            Self::I64(_) => DType::I64,
            Self::U8(_) => DType::U8,
            Self::U32(_) => DType::U32,
        }
    }

    /// Shape
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        each_dtype!(AnyNdArray, self, a => a.shape())
    }
}

impl From<&AnyNdArray> for AnyTensor {
    fn from(array: &AnyNdArray) -> Self {
        each_dtype!(AnyNdArray, array, a => Tensor::from(a).into())
    }
}
