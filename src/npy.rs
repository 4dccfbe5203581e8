//! NPY binary array streams
//!
//! Pure Rust writer and reader for the NumPy `.npy` interchange layout.
//!
//! ## Format Overview
//!
//! ```text
//! NPY := MAGIC VERSION HEADER_LEN HEADER DATA
//!
//! MAGIC      := b"\x93NUMPY"
//! VERSION    := major: u8, minor: u8          (1.0, or 2.0 for huge headers)
//! HEADER_LEN := u16 LE (v1) | u32 LE (v2, v3)
//! HEADER     := "{'descr': '<f4', 'fortran_order': False, 'shape': (2, 3), }"
//!               space padded, '\n' terminated, DATA aligned to 64 bytes
//! DATA       := row-major little-endian elements
//! ```

use crate::{
    error::{MiradorError, Result},
    tensor::{DType, Element, Tensor},
    value::{each_dtype, AnyTensor},
};

/// NPY magic bytes
pub const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Data section alignment in bytes
pub const ALIGNMENT: usize = 64;

/// Parsed NPY header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    /// Element type
    pub dtype: DType,
    /// Column-major data flag; only `false` is supported
    pub fortran_order: bool,
    /// Array shape
    pub shape: Vec<usize>,
}

impl NpyHeader {
    /// Python dict literal for this header, without padding
    #[must_use]
    pub fn to_dict(&self) -> String {
        let shape = match self.shape.as_slice() {
            [] => "()".to_string(),
            [n] => format!("({n},)"),
            dims => {
                let parts: Vec<String> = dims.iter().map(ToString::to_string).collect();
                format!("({})", parts.join(", "))
            },
        };
        format!(
            "{{'descr': '{}', 'fortran_order': {}, 'shape': {}, }}",
            self.dtype.descr(),
            if self.fortran_order { "True" } else { "False" },
            shape
        )
    }

    /// Number of elements described by the shape, `None` if it overflows
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }
}

/// Encode a tensor as a complete NPY byte stream
///
/// # Errors
///
/// Returns error if the header does not fit even a version 2.0 length field
///
/// # Examples
///
/// ```
/// use mirador::{npy, Tensor};
///
/// let t = Tensor::from_vec(vec![2, 2], vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
/// let bytes = npy::to_bytes(&t.into()).unwrap();
/// assert_eq!(&bytes[..6], npy::MAGIC);
/// assert_eq!(bytes.len(), 128 + 16); // padded header + 4 f32 values
/// ```
pub fn to_bytes(tensor: &AnyTensor) -> Result<Vec<u8>> {
    let header = NpyHeader {
        dtype: tensor.dtype(),
        fortran_order: false,
        shape: tensor.shape().to_vec(),
    };
    let mut out = encode_header(&header)?;
    out.extend_from_slice(&tensor.to_le_bytes());
    Ok(out)
}

/// Magic, version, length and padded header dict
fn encode_header(header: &NpyHeader) -> Result<Vec<u8>> {
    let dict = header.to_dict();

    // 6 magic + 2 version + 2 or 4 length bytes
    let (version, prefix_len) = if padded_len(&dict, 10) <= usize::from(u16::MAX) {
        (1u8, 10)
    } else {
        (2u8, 12)
    };
    let header_len = padded_len(&dict, prefix_len);

    let mut out = Vec::with_capacity(prefix_len + header_len);
    out.extend_from_slice(MAGIC);
    out.push(version);
    out.push(0);
    if version == 1 {
        out.extend_from_slice(&(header_len as u16).to_le_bytes());
    } else {
        let len = u32::try_from(header_len).map_err(|_| MiradorError::Npy {
            reason: format!("Header of {header_len} bytes exceeds u32 length field"),
        })?;
        out.extend_from_slice(&len.to_le_bytes());
    }
    out.extend_from_slice(dict.as_bytes());
    out.resize(prefix_len + header_len - 1, b' ');
    out.push(b'\n');
    Ok(out)
}

/// Header length including padding and the terminating newline
fn padded_len(dict: &str, prefix_len: usize) -> usize {
    let unpadded = prefix_len + dict.len() + 1;
    let pad = (ALIGNMENT - unpadded % ALIGNMENT) % ALIGNMENT;
    dict.len() + pad + 1
}

/// Parse the header of an NPY stream
///
/// Returns the header and the offset of the first data byte.
///
/// # Errors
///
/// Returns error on bad magic, unknown version, truncated input, or a
/// header dict this reader cannot interpret
pub fn read_header(bytes: &[u8]) -> Result<(NpyHeader, usize)> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(npy_err("Missing NPY magic bytes"));
    }

    let (header_len, prefix_len) = match bytes[6] {
        1 => (usize::from(u16::from_le_bytes([bytes[8], bytes[9]])), 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(npy_err("Truncated NPY length field"));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            (len as usize, 12)
        },
        major => return Err(npy_err(format!("Unsupported NPY version {major}.{}", bytes[7]))),
    };

    let end = prefix_len + header_len;
    let raw = bytes
        .get(prefix_len..end)
        .ok_or_else(|| npy_err("Truncated NPY header"))?;
    let dict = std::str::from_utf8(raw).map_err(|e| npy_err(format!("Header is not text: {e}")))?;

    Ok((parse_dict(dict.trim())?, end))
}

/// Decode a complete NPY stream
///
/// # Errors
///
/// Returns error if the header is invalid, the array is Fortran ordered, or
/// the data length disagrees with the shape
pub fn from_bytes(bytes: &[u8]) -> Result<AnyTensor> {
    let (header, offset) = read_header(bytes)?;
    if header.fortran_order {
        return Err(npy_err("Fortran-ordered arrays are not supported"));
    }

    let data = &bytes[offset..];
    let expected = header
        .size()
        .and_then(|n| n.checked_mul(header.dtype.size()))
        .ok_or_else(|| npy_err(format!("Shape {:?} is too large to address", header.shape)))?;
    if data.len() != expected {
        return Err(npy_err(format!(
            "Data section is {} bytes, shape {:?} of {} needs {expected}",
            data.len(),
            header.shape,
            header.dtype
        )));
    }

    let shape = header.shape;
    Ok(match header.dtype {
        DType::F16 => decode::<half::f16>(shape, data)?.into(),
        DType::F32 => decode::<f32>(shape, data)?.into(),
        DType::F64 => decode::<f64>(shape, data)?.into(),
        DType::I32 => decode::<i32>(shape, data)?.into(),
        DType::I64 => decode::<i64>(shape, data)?.into(),
        DType::U8 => decode::<u8>(shape, data)?.into(),
        DType::U32 => decode::<u32>(shape, data)?.into(),
    })
}

fn decode<T: Element>(shape: Vec<usize>, data: &[u8]) -> Result<Tensor<T>> {
    let values = data.chunks_exact(T::DTYPE.size()).map(T::read_le).collect();
    Tensor::from_vec(shape, values)
}

/// Parse `{'descr': .., 'fortran_order': .., 'shape': (..), }`
fn parse_dict(dict: &str) -> Result<NpyHeader> {
    let body = dict
        .strip_prefix('{')
        .and_then(|d| d.strip_suffix('}'))
        .ok_or_else(|| npy_err(format!("Header is not a dict: {dict}")))?;

    let descr = field(body, "descr")?;
    let descr = descr.trim_matches(|c| c == '\'' || c == '"');
    let dtype = DType::from_descr(descr)
        .ok_or_else(|| npy_err(format!("Unsupported descr '{descr}'")))?;

    let fortran_order = match field(body, "fortran_order")? {
        "True" => true,
        "False" => false,
        other => return Err(npy_err(format!("Bad fortran_order '{other}'"))),
    };

    let shape_src = field(body, "shape")?;
    let inner = shape_src
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| npy_err(format!("Bad shape '{shape_src}'")))?;
    let shape = inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|e| npy_err(format!("Bad dimension '{s}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(NpyHeader {
        dtype,
        fortran_order,
        shape,
    })
}

/// Raw text of the value stored under `key`
fn field<'a>(body: &'a str, key: &str) -> Result<&'a str> {
    let start = [format!("'{key}'"), format!("\"{key}\"")]
        .iter()
        .find_map(|k| body.find(k.as_str()).map(|i| i + k.len()))
        .ok_or_else(|| npy_err(format!("Header has no '{key}' entry")))?;
    let rest = body[start..].trim_start();
    let rest = rest
        .strip_prefix(':')
        .ok_or_else(|| npy_err(format!("Expected ':' after '{key}'")))?
        .trim_start();

    // A tuple value runs to its closing paren, anything else to the next comma
    let end = if rest.starts_with('(') {
        rest.find(')').map(|i| i + 1)
    } else {
        rest.find(',').or(Some(rest.len()))
    }
    .ok_or_else(|| npy_err(format!("Unterminated value for '{key}'")))?;

    Ok(rest[..end].trim())
}

fn npy_err(reason: impl Into<String>) -> MiradorError {
    MiradorError::Npy {
        reason: reason.into(),
    }
}

/// Element values of a decoded stream widened to `f64`, handy for tests and
/// inspection output
#[must_use]
pub fn to_f64_vec(tensor: &AnyTensor) -> Vec<f64> {
    each_dtype!(AnyTensor, tensor, t => t.data().iter().map(|v| widen(*v)).collect())
}

fn widen<T: Element>(v: T) -> f64 {
    v.to_json().as_f64().unwrap_or(f64::NAN)
}
