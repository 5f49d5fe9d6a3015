//! Static checks for loopnet topologies.
//!
//! Layout inference for every non-loop primitive, the conversion rules
//! that decide when a backedge type mismatch can be repaired, and the
//! diagnostics reported when it cannot.

pub mod layout;

pub use layout::{
    can_convert, check_axis, check_control_scalar, infer_output_layout, is_lossless, wider_type,
    FixSuggestion, LayoutError,
};
