//! Static layout checks for the loopnet primitive graph.
//!
//! Provides:
//! - [`infer_output_layout`]: the output layout of one non-loop primitive
//!   from its input layouts.
//! - [`check_control_scalar`] / [`check_axis`]: shape requirements the loop
//!   builder and compiler impose on trip counts, conditions and slicing.
//! - [`can_convert`] / [`is_lossless`]: when a backedge type mismatch can be
//!   repaired by inserting a Convert primitive.
//!
//! All functions are pure.

pub mod conversion;
pub mod diagnostics;
pub mod rules;

pub use conversion::{can_convert, is_lossless, wider_type};
pub use diagnostics::{FixSuggestion, LayoutError};
pub use rules::{check_axis, check_control_scalar, infer_output_layout};
