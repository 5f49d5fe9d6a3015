//! Element data types, tensor layouts and host-side scalar values.
//!
//! Every memory buffer is described by a [`Layout`]: an element
//! [`DataType`] plus a dense row-major shape. Elements are stored
//! little-endian; [`DataType::decode`] and [`DataType::encode`] convert a
//! single element to and from the host-side [`Scalar`] representation used
//! by the reference kernels and by the loop engine when it reads trip
//! counts and conditions.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    U8,
    I8,
    I32,
    I64,
    F32,
    F64,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::Bool | DataType::U8 | DataType::I8 => 1,
            DataType::I32 | DataType::F32 => 4,
            DataType::I64 | DataType::F64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::U8 | DataType::I8 | DataType::I32 | DataType::I64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    pub fn is_bool(self) -> bool {
        self == DataType::Bool
    }

    /// Lower-case short name, also used to build generated primitive ids.
    pub fn name(self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::U8 => "u8",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
        }
    }

    /// Decodes one little-endian element. `bytes` must hold at least
    /// [`size_in_bytes`](Self::size_in_bytes) bytes.
    pub fn decode(self, bytes: &[u8]) -> Scalar {
        match self {
            DataType::Bool => Scalar::Bool(bytes[0] != 0),
            DataType::U8 => Scalar::Int(bytes[0] as i64),
            DataType::I8 => Scalar::Int(bytes[0] as i8 as i64),
            DataType::I32 => Scalar::Int(i32::from_le_bytes(le(bytes)) as i64),
            DataType::I64 => Scalar::Int(i64::from_le_bytes(le(bytes))),
            DataType::F32 => Scalar::Float(f32::from_le_bytes(le(bytes)) as f64),
            DataType::F64 => Scalar::Float(f64::from_le_bytes(le(bytes))),
        }
    }

    /// Encodes `value` as one little-endian element of this type, converting
    /// with Rust `as` semantics (truncating, saturating float-to-int).
    pub fn encode(self, value: Scalar, out: &mut [u8]) {
        match self {
            DataType::Bool => out[0] = value.is_truthy() as u8,
            DataType::U8 => out[0] = value.as_i64() as u8,
            DataType::I8 => out[0] = value.as_i64() as i8 as u8,
            DataType::I32 => out[..4].copy_from_slice(&(value.as_i64() as i32).to_le_bytes()),
            DataType::I64 => out[..8].copy_from_slice(&value.as_i64().to_le_bytes()),
            DataType::F32 => out[..4].copy_from_slice(&(value.as_f64() as f32).to_le_bytes()),
            DataType::F64 => out[..8].copy_from_slice(&value.as_f64().to_le_bytes()),
        }
    }
}

fn le<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut array = [0u8; N];
    array.copy_from_slice(&bytes[..N]);
    array
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Tensor dimensions. Most tensors in practice have rank <= 4.
pub type Shape = SmallVec<[usize; 4]>;

/// Data type plus dense row-major shape of a buffer.
///
/// A rank-0 shape (`[]`) is a scalar holding one element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    pub data_type: DataType,
    pub shape: Shape,
}

impl Layout {
    pub fn new(data_type: DataType, dims: &[usize]) -> Self {
        Layout {
            data_type,
            shape: Shape::from_slice(dims),
        }
    }

    /// Single-element layout.
    pub fn scalar(data_type: DataType) -> Self {
        Layout::new(data_type, &[1])
    }

    /// Number of elements.
    pub fn linear_size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.linear_size() * self.data_type.size_in_bytes()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.shape.get(axis).copied()
    }

    /// Copy of this layout with dimension `axis` replaced by `value`.
    /// Returns `None` when `axis` is out of range.
    pub fn with_dim(&self, axis: usize, value: usize) -> Option<Layout> {
        let mut shape = self.shape.clone();
        *shape.get_mut(axis)? = value;
        Some(Layout {
            data_type: self.data_type,
            shape,
        })
    }

    pub fn with_data_type(&self, data_type: DataType) -> Layout {
        Layout {
            data_type,
            shape: self.shape.clone(),
        }
    }

    /// Product of the dimensions before `axis`.
    pub fn outer_size(&self, axis: usize) -> usize {
        self.shape.iter().take(axis).product()
    }

    /// Product of the dimensions after `axis`.
    pub fn inner_size(&self, axis: usize) -> usize {
        self.shape.iter().skip(axis + 1).product()
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.data_type)?;
        for (i, dim) in self.shape.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", dim)?;
        }
        write!(f, "]")
    }
}

// ---------------------------------------------------------------------------
// Host-side values
// ---------------------------------------------------------------------------

/// One element as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Bool(b) => b as i64 as f64,
            Scalar::Int(v) => v as f64,
            Scalar::Float(v) => v,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Scalar::Bool(b) => b as i64,
            Scalar::Int(v) => v,
            Scalar::Float(v) => v as i64,
        }
    }

    pub fn is_truthy(self) -> bool {
        match self {
            Scalar::Bool(b) => b,
            Scalar::Int(v) => v != 0,
            Scalar::Float(v) => v != 0.0,
        }
    }
}

/// Literal tensor contents, as written in a serialized topology.
///
/// Deserialized untagged: `[true, false]` is `Bool`, `[1, 2]` is `Int`,
/// anything containing a fractional number is `Float`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TensorValues {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    Float(Vec<f64>),
}

impl TensorValues {
    pub fn len(&self) -> usize {
        match self {
            TensorValues::Bool(v) => v.len(),
            TensorValues::Int(v) => v.len(),
            TensorValues::Float(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Scalar> {
        match self {
            TensorValues::Bool(v) => v.get(index).map(|b| Scalar::Bool(*b)),
            TensorValues::Int(v) => v.get(index).map(|i| Scalar::Int(*i)),
            TensorValues::Float(v) => v.get(index).map(|f| Scalar::Float(*f)),
        }
    }
}

impl Default for TensorValues {
    fn default() -> Self {
        TensorValues::Int(Vec::new())
    }
}
