//! Error types for compilation and execution.
//!
//! Every error is fatal to the operation that raised it; nothing is
//! retried. [`ExecutionError`] is `Clone` so a failed device task can hand
//! the same error to every event that depends on it.

use loopnet_check::LayoutError;
use loopnet_core::error::CoreError;
use loopnet_core::id::PrimitiveId;
use loopnet_core::types::{DataType, Layout};

/// Errors raised by an [`ImplementationSelector`](crate::kernels::ImplementationSelector).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("no implementation found for '{primitive}' ({op}) on {data_type}")]
    NoImplementationFound {
        primitive: PrimitiveId,
        op: String,
        data_type: DataType,
    },
}

/// Errors raised while compiling a topology into a [`Program`](crate::program::Program).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// Dangling or self-referential ids, invalid mapping descriptors,
    /// unresolved body parameters.
    #[error("malformed graph at '{primitive}': {reason}")]
    MalformedGraph {
        primitive: PrimitiveId,
        reason: String,
    },

    /// A loop slices along an axis but no iteration bound can be derived.
    #[error("loop '{loop_id}' slices along an axis but has no trip count or iteration bound")]
    InvalidLoopBound { loop_id: PrimitiveId },

    /// A backedge connects layouts no conversion can reconcile.
    #[error("backedge '{from}' -> '{to}' in loop '{loop_id}': {from_layout} cannot feed {to_layout}")]
    TypeMismatch {
        loop_id: PrimitiveId,
        from: PrimitiveId,
        to: PrimitiveId,
        from_layout: Layout,
        to_layout: Layout,
    },

    /// Surfaced unchanged from kernel selection.
    #[error(transparent)]
    NoImplementationFound(#[from] KernelError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl CompileError {
    pub(crate) fn malformed(primitive: &PrimitiveId, reason: impl Into<String>) -> Self {
        CompileError::MalformedGraph {
            primitive: primitive.clone(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while binding or executing a network.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    /// An id could not be resolved at run time.
    #[error("malformed graph at '{primitive}': {reason}")]
    MalformedGraph {
        primitive: PrimitiveId,
        reason: String,
    },

    /// A memory bound to a primitive does not match its compiled layout.
    #[error("type mismatch binding '{primitive}': expected {expected}, got {actual}")]
    TypeMismatch {
        primitive: PrimitiveId,
        expected: Layout,
        actual: Layout,
    },

    /// A loop needed a per-iteration buffer beyond the ones allocated.
    #[error("loop '{loop_id}' exceeded its iteration bound of {max_iteration}")]
    OutOfBoundIteration {
        loop_id: PrimitiveId,
        max_iteration: i64,
    },

    /// A loop with an unbounded trip count has nothing that could end it.
    #[error("loop '{loop_id}' has an unbounded trip count, no continue condition and no iteration bound")]
    InvalidLoopBound { loop_id: PrimitiveId },

    /// A kernel failed while running.
    #[error("kernel for '{primitive}' failed: {message}")]
    Kernel {
        primitive: PrimitiveId,
        message: String,
    },

    #[error(transparent)]
    Memory(#[from] CoreError),
}

impl ExecutionError {
    pub(crate) fn malformed(primitive: &PrimitiveId, reason: impl Into<String>) -> Self {
        ExecutionError::MalformedGraph {
            primitive: primitive.clone(),
            reason: reason.into(),
        }
    }
}
