//! Conversion rules between element types.
//!
//! A Convert primitive changes the element type and keeps the shape, so a
//! layout can be converted into another exactly when the shapes agree.
//! Whether a conversion loses information is tracked separately:
//!
//! - Bool -> any integer or float type
//! - Integer widening: i8 -> i32 -> i64, u8 -> i32 -> i64
//! - Float widening: f32 -> f64
//! - Integer -> float when the float mantissa holds every value
//!   (i8/u8 -> f32, i8/u8/i32 -> f64)
//! - Everything else (narrowing, float -> integer, anything -> bool) is lossy

use loopnet_core::types::{DataType, Layout};

/// Returns `true` if a Convert primitive can turn `from` into `to`.
pub fn can_convert(from: &Layout, to: &Layout) -> bool {
    from.shape == to.shape
}

/// Returns `true` if every value of `from` is exactly representable in `to`.
pub fn is_lossless(from: DataType, to: DataType) -> bool {
    if from == to {
        return true;
    }
    match (from, to) {
        (DataType::Bool, _) => true,
        (_, DataType::Bool) => false,
        (f, t) if f.is_integer() && t.is_integer() => integer_widens(f, t),
        (DataType::F32, DataType::F64) => true,
        (DataType::U8 | DataType::I8, DataType::F32) => true,
        (DataType::U8 | DataType::I8 | DataType::I32, DataType::F64) => true,
        _ => false,
    }
}

fn integer_widens(from: DataType, to: DataType) -> bool {
    match (from, to) {
        (DataType::U8, DataType::I32 | DataType::I64) => true,
        (DataType::I8, DataType::I32 | DataType::I64) => true,
        (DataType::I32, DataType::I64) => true,
        _ => false,
    }
}

/// The type both operands convert to losslessly, if one of them already is
/// that type.
pub fn wider_type(a: DataType, b: DataType) -> Option<DataType> {
    if is_lossless(a, b) {
        Some(b)
    } else if is_lossless(b, a) {
        Some(a)
    } else {
        None
    }
}
