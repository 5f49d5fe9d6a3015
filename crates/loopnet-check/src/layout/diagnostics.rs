//! Layout error diagnostics with context fields and fix suggestions.
//!
//! [`LayoutError`] names the primitive involved, the port where relevant,
//! and the expected versus actual layout or type. When a conversion would
//! repair the problem a [`FixSuggestion`] is attached.

use loopnet_core::id::PrimitiveId;
use loopnet_core::types::{DataType, Layout};
use serde::{Deserialize, Serialize};

/// A layout error detected during static inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum LayoutError {
    /// An input has a different element type than the primitive expects.
    #[error("type mismatch at '{primitive}': port {port} expects {expected}, got {actual}")]
    TypeMismatch {
        primitive: PrimitiveId,
        port: u16,
        expected: DataType,
        actual: DataType,
        /// Suggested fix, if one is obvious.
        suggestion: Option<FixSuggestion>,
    },

    /// Two operands cannot be combined elementwise.
    #[error("shape mismatch at '{primitive}': {lhs} vs {rhs}")]
    ShapeMismatch {
        primitive: PrimitiveId,
        lhs: Layout,
        rhs: Layout,
    },

    /// A primitive received the wrong number of inputs.
    #[error("unexpected input count: '{primitive}' expects {expected} inputs, got {actual}")]
    WrongInputCount {
        primitive: PrimitiveId,
        expected: usize,
        actual: usize,
    },

    /// Literal values do not fill the declared layout.
    #[error("'{primitive}' declares {expected} elements but lists {actual} values")]
    ValueCountMismatch {
        primitive: PrimitiveId,
        expected: usize,
        actual: usize,
    },

    /// A trip count or condition is not a single integer or boolean element.
    #[error("'{primitive}' must be a single integer or boolean element, got {layout}")]
    InvalidControlScalar {
        primitive: PrimitiveId,
        layout: Layout,
    },

    /// A slicing axis does not exist in the tensor.
    #[error("axis {axis} out of range for '{primitive}' with layout {layout}")]
    InvalidAxis {
        primitive: PrimitiveId,
        axis: usize,
        layout: Layout,
    },

    /// The op's layout depends on a compiled body and is inferred by the
    /// program compiler instead.
    #[error("'{primitive}' ({op}) has no static layout rule")]
    NoLayoutRule { primitive: PrimitiveId, op: String },
}

/// A suggested fix for a layout error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixSuggestion {
    /// Insert a Convert primitive between the producer and the consumer.
    InsertConvert { from: DataType, to: DataType },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_mismatch_message() {
        let err = LayoutError::TypeMismatch {
            primitive: PrimitiveId::new("add"),
            port: 1,
            expected: DataType::F32,
            actual: DataType::I32,
            suggestion: Some(FixSuggestion::InsertConvert {
                from: DataType::I32,
                to: DataType::F32,
            }),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch at 'add': port 1 expects f32, got i32"
        );
    }

    #[test]
    fn serde_roundtrip() {
        let err = LayoutError::ShapeMismatch {
            primitive: PrimitiveId::new("mul"),
            lhs: Layout::new(DataType::F32, &[2]),
            rhs: Layout::new(DataType::F32, &[3]),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: LayoutError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
