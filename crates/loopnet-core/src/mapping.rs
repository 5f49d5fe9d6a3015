//! Mapping descriptors connecting a loop node to its body.
//!
//! - [`InputMapping`]: outer tensor -> body parameter, either whole
//!   (`axis < 0`) or one slice per iteration along `axis`.
//! - [`OutputMapping`]: body result -> outer tensor, either the value of the
//!   last iteration (`axis < 0`) or the per-iteration results concatenated
//!   along `axis`.
//! - [`BackedgeMapping`]: body result of iteration `i` -> body parameter of
//!   iteration `i + 1`.
//!
//! # Slicing
//!
//! `start` and `stride` count elements along the iteration axis. Iteration
//! `i` covers `[offset_i, offset_i + part)` where `part` is the body-side
//! extent of that axis and `offset_i = start_r + i * stride`. A negative
//! `start` resolves to the last slot, see [`AxisSlice::resolved_start`].

use serde::{Deserialize, Serialize};

use crate::id::PrimitiveId;

/// Axis slicing parameters of a sliced mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AxisSlice {
    pub axis: usize,
    #[serde(default)]
    pub start: i64,
    #[serde(default = "default_end")]
    pub end: i64,
    #[serde(default = "default_stride")]
    pub stride: i64,
}

fn default_axis() -> i64 {
    -1
}

fn default_end() -> i64 {
    -1
}

fn default_stride() -> i64 {
    1
}

impl AxisSlice {
    /// Forward slicing from the first slot with unit stride.
    pub fn forward(axis: usize) -> Self {
        AxisSlice {
            axis,
            start: 0,
            end: -1,
            stride: 1,
        }
    }

    /// Backward slicing from the last slot with unit stride.
    pub fn reverse(axis: usize) -> Self {
        AxisSlice {
            axis,
            start: -1,
            end: 0,
            stride: -1,
        }
    }

    /// Start offset with a negative `start` resolved against `slots`
    /// iterations: the last slot, `(slots - 1) * |stride|`.
    pub fn resolved_start(&self, slots: i64) -> i64 {
        if self.start >= 0 {
            self.start
        } else {
            (slots - 1).max(0) * self.stride.abs()
        }
    }

    /// Offset along the axis of the slice used by `iteration`.
    pub fn offset(&self, resolved_start: i64, iteration: i64) -> i64 {
        resolved_start + iteration * self.stride
    }

    /// Number of iterations that fit an axis of `axis_len` elements when each
    /// slice is `part` elements wide, starting at `resolved_start`.
    pub fn slots_within(&self, resolved_start: i64, axis_len: usize, part: usize) -> i64 {
        let axis_len = axis_len as i64;
        let part = part as i64;
        if self.stride == 0 || resolved_start < 0 || resolved_start + part > axis_len {
            return 0;
        }
        if self.stride > 0 {
            (axis_len - part - resolved_start) / self.stride + 1
        } else {
            resolved_start / -self.stride + 1
        }
    }
}

/// Outer tensor -> body parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMapping {
    pub external_id: PrimitiveId,
    pub internal_id: PrimitiveId,
    #[serde(default = "default_axis")]
    pub axis: i64,
    #[serde(default)]
    pub start: i64,
    #[serde(default = "default_end")]
    pub end: i64,
    #[serde(default = "default_stride")]
    pub stride: i64,
}

impl InputMapping {
    /// Whole-tensor mapping, the same buffer every iteration.
    pub fn invariant(external_id: impl Into<PrimitiveId>, internal_id: impl Into<PrimitiveId>) -> Self {
        InputMapping {
            external_id: external_id.into(),
            internal_id: internal_id.into(),
            axis: -1,
            start: 0,
            end: -1,
            stride: 1,
        }
    }

    /// One slice per iteration along `slice.axis`.
    pub fn sliced(
        external_id: impl Into<PrimitiveId>,
        internal_id: impl Into<PrimitiveId>,
        slice: AxisSlice,
    ) -> Self {
        InputMapping {
            external_id: external_id.into(),
            internal_id: internal_id.into(),
            axis: slice.axis as i64,
            start: slice.start,
            end: slice.end,
            stride: slice.stride,
        }
    }

    pub fn is_sliced(&self) -> bool {
        self.axis >= 0
    }

    pub fn axis_slice(&self) -> Option<AxisSlice> {
        slice_of(self.axis, self.start, self.end, self.stride)
    }
}

/// Body result -> outer tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMapping {
    pub external_id: PrimitiveId,
    pub internal_id: PrimitiveId,
    #[serde(default = "default_axis")]
    pub axis: i64,
    #[serde(default)]
    pub start: i64,
    #[serde(default = "default_end")]
    pub end: i64,
    #[serde(default = "default_stride")]
    pub stride: i64,
}

impl OutputMapping {
    /// The value produced by the last iteration.
    pub fn final_value(external_id: impl Into<PrimitiveId>, internal_id: impl Into<PrimitiveId>) -> Self {
        OutputMapping {
            external_id: external_id.into(),
            internal_id: internal_id.into(),
            axis: -1,
            start: 0,
            end: -1,
            stride: 1,
        }
    }

    /// Per-iteration results concatenated along `slice.axis`.
    pub fn concatenated(
        external_id: impl Into<PrimitiveId>,
        internal_id: impl Into<PrimitiveId>,
        slice: AxisSlice,
    ) -> Self {
        OutputMapping {
            external_id: external_id.into(),
            internal_id: internal_id.into(),
            axis: slice.axis as i64,
            start: slice.start,
            end: slice.end,
            stride: slice.stride,
        }
    }

    pub fn is_sliced(&self) -> bool {
        self.axis >= 0
    }

    pub fn axis_slice(&self) -> Option<AxisSlice> {
        slice_of(self.axis, self.start, self.end, self.stride)
    }
}

fn slice_of(axis: i64, start: i64, end: i64, stride: i64) -> Option<AxisSlice> {
    if axis < 0 {
        return None;
    }
    Some(AxisSlice {
        axis: axis as usize,
        start,
        end,
        stride,
    })
}

/// Body result of one iteration feeding a body parameter of the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackedgeMapping {
    pub from_internal_id: PrimitiveId,
    pub to_internal_id: PrimitiveId,
}

impl BackedgeMapping {
    pub fn new(from: impl Into<PrimitiveId>, to: impl Into<PrimitiveId>) -> Self {
        BackedgeMapping {
            from_internal_id: from.into(),
            to_internal_id: to.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn invariant_mapping_has_no_slice() {
        let mapping = InputMapping::invariant("x", "body_x");
        assert!(!mapping.is_sliced());
        assert!(mapping.axis_slice().is_none());
    }

    #[test]
    fn sliced_mapping_roundtrips_axis_slice() {
        let slice = AxisSlice {
            axis: 1,
            start: 2,
            end: -1,
            stride: 2,
        };
        let mapping = OutputMapping::concatenated("y", "body_y", slice);
        assert_eq!(mapping.axis_slice(), Some(slice));
    }

    #[test]
    fn negative_start_resolves_to_last_slot() {
        assert_eq!(AxisSlice::reverse(0).resolved_start(5), 4);
        let wide = AxisSlice {
            axis: 0,
            start: -1,
            end: 0,
            stride: -2,
        };
        assert_eq!(wide.resolved_start(3), 4);
        assert_eq!(AxisSlice::reverse(0).resolved_start(0), 0);
    }

    #[test]
    fn slots_within_axis() {
        let forward = AxisSlice::forward(0);
        assert_eq!(forward.slots_within(0, 4, 1), 4);
        assert_eq!(forward.slots_within(1, 4, 2), 2);
        assert_eq!(AxisSlice::reverse(0).slots_within(3, 4, 1), 4);
        assert_eq!(forward.slots_within(4, 4, 1), 0);
    }

    #[test]
    fn serde_defaults_make_invariant() {
        let json = r#"{"external_id":"x","internal_id":"p"}"#;
        let mapping: InputMapping = serde_json::from_str(json).unwrap();
        assert_eq!(mapping, InputMapping::invariant("x", "p"));
    }

    proptest! {
        #[test]
        fn offset_follows_start_plus_iteration_times_stride(
            start in 0i64..64,
            stride in -4i64..=4,
            iteration in 0i64..32,
        ) {
            let slice = AxisSlice { axis: 0, start, end: -1, stride };
            let resolved = slice.resolved_start(32);
            prop_assert_eq!(slice.offset(resolved, iteration), start + iteration * stride);
        }

        #[test]
        fn every_counted_slot_fits_the_axis(
            start in 0i64..16,
            stride in 1i64..4,
            part in 1usize..4,
            axis_len in 0usize..40,
        ) {
            let slice = AxisSlice { axis: 0, start, end: -1, stride };
            let slots = slice.slots_within(start, axis_len, part);
            for i in 0..slots {
                let offset = slice.offset(start, i);
                prop_assert!(offset >= 0);
                prop_assert!(offset as usize + part <= axis_len);
            }
            let next = slice.offset(start, slots);
            prop_assert!(next < 0 || next as usize + part > axis_len);
        }
    }
}
