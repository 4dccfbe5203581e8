//! Tensor implementation
//!
//! This module provides the crate's own `Tensor` type, an N-dimensional
//! row-major array. It is the numeric backend model forward passes produce;
//! `ndarray` arrays coming out of post-processing are the other backend and
//! live next to it in [`crate::value`].

use std::fmt;

use half::f16;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use num_traits::Num;

use crate::error::{MiradorError, Result};

/// Element type of a numeric array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// IEEE half precision
    F16,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 8-bit unsigned integer
    U8,
    /// 32-bit unsigned integer
    U32,
}

impl DType {
    /// Size of one element in bytes
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::F16 => 2,
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }

    /// NumPy-style name (`float32`, `int64`, ...)
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::F16 => "float16",
            Self::F32 => "float32",
            Self::F64 => "float64",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::U8 => "uint8",
            Self::U32 => "uint32",
        }
    }

    /// Little-endian array-interchange type descriptor (`<f4`, `|u1`, ...)
    #[must_use]
    pub fn descr(self) -> &'static str {
        match self {
            Self::F16 => "<f2",
            Self::F32 => "<f4",
            Self::F64 => "<f8",
            Self::I32 => "<i4",
            Self::I64 => "<i8",
            Self::U8 => "|u1",
            Self::U32 => "<u4",
        }
    }

    /// Parse a type descriptor written by [`DType::descr`]
    ///
    /// Single-byte types are accepted with any byte-order marker.
    #[must_use]
    pub fn from_descr(descr: &str) -> Option<Self> {
        match descr {
            "<f2" => Some(Self::F16),
            "<f4" => Some(Self::F32),
            "<f8" => Some(Self::F64),
            "<i4" => Some(Self::I32),
            "<i8" => Some(Self::I64),
            "|u1" | "<u1" | "=u1" => Some(Self::U8),
            "<u4" => Some(Self::U32),
            _ => None,
        }
    }

    /// Whether the element type is floating point
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::F32 | Self::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scalar types that can live in a [`Tensor`]
pub trait Element: Num + Copy + Send + Sync + fmt::Debug + 'static {
    /// Element type tag
    const DTYPE: DType;

    /// Append the little-endian bytes of `self`
    fn write_le(self, out: &mut Vec<u8>);

    /// Read one element from exactly `DTYPE.size()` little-endian bytes
    fn read_le(chunk: &[u8]) -> Self;

    /// Builtin JSON number for this element; non-finite floats become `null`
    fn to_json(self) -> serde_json::Value;
}

macro_rules! int_element {
    ($t:ty, $dtype:ident, $n:expr) => {
        impl Element for $t {
            const DTYPE: DType = DType::$dtype;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(chunk: &[u8]) -> Self {
                let mut buf = [0u8; $n];
                buf.copy_from_slice(chunk);
                <$t>::from_le_bytes(buf)
            }

            fn to_json(self) -> serde_json::Value {
                serde_json::Value::from(self)
            }
        }
    };
}

macro_rules! float_element {
    ($t:ty, $dtype:ident, $n:expr, $to_f64:expr) => {
        impl Element for $t {
            const DTYPE: DType = DType::$dtype;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(chunk: &[u8]) -> Self {
                let mut buf = [0u8; $n];
                buf.copy_from_slice(chunk);
                <$t>::from_le_bytes(buf)
            }

            fn to_json(self) -> serde_json::Value {
                let wide: f64 = $to_f64(self);
                serde_json::Number::from_f64(wide)
                    .map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
        }
    };
}

int_element!(i32, I32, 4);
int_element!(i64, I64, 8);
int_element!(u8, U8, 1);
int_element!(u32, U32, 4);
float_element!(f16, F16, 2, |v: f16| v.to_f64());
float_element!(f32, F32, 4, f64::from);
float_element!(f64, F64, 8, |v: f64| v);

/// N-dimensional row-major tensor
///
/// # Examples
///
/// ```
/// use mirador::Tensor;
///
/// // Create a 2x3 tensor
/// let t = Tensor::from_vec(vec![2, 3], vec![
///     1.0f32, 2.0, 3.0,
///     4.0, 5.0, 6.0,
/// ]).unwrap();
///
/// assert_eq!(t.shape(), &[2, 3]);
/// assert_eq!(t.ndim(), 2);
/// assert_eq!(t.size(), 6);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T: Element> {
    /// Flattened data in row-major order
    data: Vec<T>,
    /// Shape of the tensor; empty for a 0-d scalar
    shape: Vec<usize>,
}

impl<T: Element> Tensor<T> {
    /// Create a new tensor from a shape and row-major data
    ///
    /// An empty shape is a 0-d tensor holding one element. Zero-length
    /// dimensions are allowed and hold no data.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the data size doesn't match the shape
    pub fn from_vec(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        let expected: usize = shape.iter().product();

        if data.len() != expected {
            return Err(MiradorError::DataShapeMismatch {
                data_size: data.len(),
                shape,
                expected,
            });
        }

        Ok(Self { data, shape })
    }

    /// 0-d tensor holding a single value
    #[must_use]
    pub fn scalar(value: T) -> Self {
        Self {
            data: vec![value],
            shape: Vec::new(),
        }
    }

    /// Get the shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the total number of elements
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get a reference to the underlying row-major data
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Consume the tensor, returning its row-major data
    #[must_use]
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Element type tag
    #[must_use]
    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    /// Element at a multi-dimensional index, `None` when out of bounds
    #[must_use]
    pub fn get(&self, index: &[usize]) -> Option<T> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0;
        for (&i, &dim) in index.iter().zip(&self.shape) {
            if i >= dim {
                return None;
            }
            offset = offset * dim + i;
        }
        self.data.get(offset).copied()
    }

    /// Stack equally shaped tensors along a new leading axis
    ///
    /// # Errors
    ///
    /// Returns `Err` if `tensors` is empty or the shapes differ
    ///
    /// # Examples
    ///
    /// ```
    /// use mirador::Tensor;
    ///
    /// let a = Tensor::from_vec(vec![2], vec![1i32, 2]).unwrap();
    /// let b = Tensor::from_vec(vec![2], vec![3i32, 4]).unwrap();
    /// let s = Tensor::stack(&[a, b]).unwrap();
    /// assert_eq!(s.shape(), &[2, 2]);
    /// assert_eq!(s.data(), &[1, 2, 3, 4]);
    /// ```
    pub fn stack(tensors: &[Self]) -> Result<Self> {
        let first = tensors.first().ok_or_else(|| MiradorError::InvalidShape {
            reason: "Cannot stack an empty list of tensors".to_string(),
        })?;

        if let Some((i, t)) = tensors.iter().enumerate().find(|(_, t)| t.shape != first.shape) {
            return Err(MiradorError::InvalidShape {
                reason: format!(
                    "Cannot stack tensor {i} with shape {:?} onto shape {:?}",
                    t.shape, first.shape
                ),
            });
        }

        let views = tensors.iter().map(Self::view).collect::<Result<Vec<_>>>()?;
        let stacked = ndarray::stack(Axis(0), &views).map_err(|e| MiradorError::InvalidShape {
            reason: format!("Cannot stack {} tensors: {e}", tensors.len()),
        })?;
        Ok(Self::from(&stacked))
    }

    /// Reorder axes; output axis `i` is input axis `axes[i]`
    ///
    /// # Errors
    ///
    /// Returns `Err` if `axes` is not a permutation of `0..ndim`
    ///
    /// # Examples
    ///
    /// ```
    /// use mirador::Tensor;
    ///
    /// let t = Tensor::from_vec(vec![2, 3], vec![0u8, 1, 2, 3, 4, 5]).unwrap();
    /// let p = t.permute(&[1, 0]).unwrap();
    /// assert_eq!(p.shape(), &[3, 2]);
    /// assert_eq!(p.data(), &[0, 3, 1, 4, 2, 5]);
    /// ```
    pub fn permute(&self, axes: &[usize]) -> Result<Self> {
        let ndim = self.ndim();
        let mut seen = vec![false; ndim];
        if axes.len() != ndim {
            return Err(MiradorError::InvalidShape {
                reason: format!("Permutation {axes:?} does not cover {ndim} axes"),
            });
        }
        for &axis in axes {
            if axis >= ndim || seen[axis] {
                return Err(MiradorError::InvalidShape {
                    reason: format!("Invalid permutation {axes:?} for {ndim} axes"),
                });
            }
            seen[axis] = true;
        }

        // Iterating the permuted view walks the output in row-major order
        let permuted = self.view()?.permuted_axes(IxDyn(axes));
        Ok(Self {
            shape: permuted.shape().to_vec(),
            data: permuted.iter().copied().collect(),
        })
    }

    /// Borrow as an `ndarray` view
    fn view(&self) -> Result<ArrayViewD<'_, T>> {
        ArrayViewD::from_shape(IxDyn(&self.shape), &self.data).map_err(|e| {
            MiradorError::InvalidShape {
                reason: format!("Shape {:?} does not describe the data: {e}", self.shape),
            }
        })
    }

    /// Apply `f` to every element
    #[must_use]
    pub fn map<U: Element>(&self, f: impl Fn(T) -> U) -> Tensor<U> {
        Tensor {
            data: self.data.iter().map(|&v| f(v)).collect(),
            shape: self.shape.clone(),
        }
    }
}

impl<T: Element> From<&ArrayD<T>> for Tensor<T> {
    fn from(array: &ArrayD<T>) -> Self {
        // `iter` walks logical row-major order whatever the memory layout
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }
}

impl<T: Element + fmt::Display> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?}, dtype={}, data=[", self.shape, T::DTYPE)?;
        for (i, val) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{val}")?;
        }
        write!(f, "])")
    }
}
