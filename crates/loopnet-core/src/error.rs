//! Core error types for loopnet-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering
//! topology construction, graph building and memory view access.

use thiserror::Error;

use crate::id::PrimitiveId;
use crate::types::{DataType, Layout};

/// Core errors produced by the loopnet-core crate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Two primitives (or output ports) share one id.
    #[error("duplicate primitive id: '{id}'")]
    DuplicatePrimitive { id: PrimitiveId },

    /// A primitive id was not found in the topology.
    #[error("primitive not found: '{id}'")]
    PrimitiveNotFound { id: PrimitiveId },

    /// A primitive names an input that nothing produces.
    #[error("primitive '{referenced_by}' references unknown input '{id}'")]
    UnknownInput {
        id: PrimitiveId,
        referenced_by: PrimitiveId,
    },

    /// The data dependencies contain a cycle through this primitive.
    #[error("dependency cycle through primitive '{id}'")]
    CycleDetected { id: PrimitiveId },

    /// Literal values do not fill the declared layout.
    #[error("layout {layout} holds {expected} elements, got {actual} values")]
    ValueCountMismatch {
        layout: Layout,
        expected: usize,
        actual: usize,
    },

    /// A view would extend past the end of its allocation.
    #[error("view [{offset}, {offset}+{len}) exceeds {capacity} bytes")]
    ViewOutOfRange {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    /// Two views cannot be copied into one another.
    #[error("layout mismatch: expected {expected}, got {actual}")]
    LayoutMismatch { expected: Layout, actual: Layout },

    /// A scalar integer was read from a buffer of a non-integer type.
    #[error("cannot read an integer scalar from {data_type} memory")]
    NonIntegerScalar { data_type: DataType },
}
