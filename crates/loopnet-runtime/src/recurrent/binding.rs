//! Per-iteration memory of a loop instance.
//!
//! Every binding here is created once, the first time a loop runs against
//! outer memories of a given shape, and reused by later runs. Outer memories
//! that are replaced by others of the same layout are re-pointed in place.

use std::collections::HashMap;

use loopnet_core::id::PrimitiveId;
use loopnet_core::mapping::AxisSlice;
use loopnet_core::memory::MemoryView;
use loopnet_core::types::Layout;

use crate::engine::Engine;
use crate::error::ExecutionError;
use crate::loop_builder::{concat_extent, input_start, slice_count};
use crate::stream::{Event, Stream};

use super::LoopIo;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// An outer tensor viewed as `[outer, axis_len, inner]` around the
/// iteration axis, with slices `part` elements wide along it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceGeometry {
    pub outer: usize,
    pub axis_len: usize,
    pub part: usize,
    pub inner: usize,
    pub element_size: usize,
}

impl SliceGeometry {
    pub fn new(layout: &Layout, axis: usize, part: usize) -> Self {
        SliceGeometry {
            outer: layout.outer_size(axis),
            axis_len: layout.dim(axis).unwrap_or(0),
            part,
            inner: layout.inner_size(axis),
            element_size: layout.data_type.size_in_bytes(),
        }
    }

    /// Slices are single contiguous byte ranges.
    pub fn is_contiguous(&self) -> bool {
        self.outer == 1
    }

    fn row_bytes(&self) -> usize {
        self.part * self.inner * self.element_size
    }

    /// Byte position of element `offset` along the axis in outer row `row`.
    pub fn byte_offset(&self, row: usize, offset: usize) -> usize {
        (row * self.axis_len + offset) * self.inner * self.element_size
    }

    /// Copies the slice at `offset` out of `external` into `slice`.
    pub fn gather(
        &self,
        external: &MemoryView,
        offset: usize,
        slice: &MemoryView,
    ) -> Result<(), ExecutionError> {
        let row_bytes = self.row_bytes();
        for row in 0..self.outer {
            slice.copy_bytes_from(row * row_bytes, external, self.byte_offset(row, offset), row_bytes)?;
        }
        Ok(())
    }

    /// Copies `slice` into `external` at `offset`.
    pub fn scatter(
        &self,
        slice: &MemoryView,
        offset: usize,
        external: &MemoryView,
    ) -> Result<(), ExecutionError> {
        let row_bytes = self.row_bytes();
        for row in 0..self.outer {
            external.copy_bytes_from(self.byte_offset(row, offset), slice, row * row_bytes, row_bytes)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sliced bindings
// ---------------------------------------------------------------------------

/// An axis-mapped input or output with its preallocated per-iteration views.
#[derive(Debug)]
pub struct SlicedMemoryBinding {
    pub external_id: PrimitiveId,
    pub internal_id: PrimitiveId,
    /// Outer memory the binding was created against.
    pub external: MemoryView,
    views: Vec<MemoryView>,
    pub geometry: SliceGeometry,
    pub slice: AxisSlice,
    /// Resolved start offset for inputs. Outputs resolve a negative start
    /// against the executed iteration count when scattering.
    pub start: i64,
    /// Elements per iteration view.
    pub linear_size: usize,
    /// Bytes between consecutive slices of one outer row.
    pub byte_stride: i64,
    /// Byte position of the first slice in the outer tensor.
    pub byte_offset: i64,
    /// Views alias the outer memory; no gather or scatter is needed.
    pub zero_copy: bool,
}

impl SlicedMemoryBinding {
    /// Views of every slice of `external` the loop may read, at most
    /// `max_iteration` when that is known. A negative start is the slot of
    /// iteration `max_iteration - 1`, or the last slice of the axis when the
    /// iteration count is open.
    pub fn for_input(
        engine: &Engine,
        external_id: &PrimitiveId,
        internal_id: &PrimitiveId,
        slice: AxisSlice,
        external: MemoryView,
        parameter: &Layout,
        max_iteration: i64,
    ) -> Result<Self, ExecutionError> {
        let part = slice_part(internal_id, &external, parameter, &slice, true)?;
        let geometry = SliceGeometry::new(external.layout(), slice.axis, part);

        let mut count = slice_count(&slice, geometry.axis_len, part, max_iteration).max(0);
        if max_iteration >= 0 {
            count = count.min(max_iteration);
        }
        let start = input_start(&slice, geometry.axis_len, part, max_iteration);

        let zero_copy = geometry.is_contiguous();
        let views = (0..count)
            .map(|i| {
                if zero_copy {
                    let offset = slice.offset(start, i) as usize;
                    external
                        .subview(geometry.byte_offset(0, offset), parameter.clone())
                        .map_err(ExecutionError::from)
                } else {
                    Ok(engine.allocate(parameter.clone()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let element_bytes = (geometry.inner * geometry.element_size) as i64;
        tracing::debug!(
            %external_id,
            %internal_id,
            slices = views.len(),
            zero_copy,
            "bound sliced input"
        );
        Ok(SlicedMemoryBinding {
            external_id: external_id.clone(),
            internal_id: internal_id.clone(),
            external,
            views,
            geometry,
            slice,
            start,
            linear_size: parameter.linear_size(),
            byte_stride: slice.stride * element_bytes,
            byte_offset: start * element_bytes,
            zero_copy,
        })
    }

    /// One result-sized view per iteration up to `max_iteration`.
    ///
    /// With contiguous slices and a non-negative forward start the views are
    /// the final slots of `external` itself.
    pub fn for_output(
        engine: &Engine,
        external_id: &PrimitiveId,
        internal_id: &PrimitiveId,
        slice: AxisSlice,
        external: MemoryView,
        result: &Layout,
        max_iteration: i64,
    ) -> Result<Self, ExecutionError> {
        let part = slice_part(internal_id, &external, result, &slice, false)?;
        let geometry = SliceGeometry::new(external.layout(), slice.axis, part);
        let count = max_iteration.max(0);
        let zero_copy = geometry.is_contiguous() && slice.start >= 0 && slice.stride > 0;

        let views = (0..count)
            .map(|i| {
                if zero_copy {
                    let offset = slice.offset(slice.start, i) as usize;
                    external
                        .subview(geometry.byte_offset(0, offset), result.clone())
                        .map_err(ExecutionError::from)
                } else {
                    Ok(engine.allocate(result.clone()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let element_bytes = (geometry.inner * geometry.element_size) as i64;
        let start = slice.resolved_start(count);
        tracing::debug!(
            %external_id,
            %internal_id,
            slices = views.len(),
            zero_copy,
            "bound concatenated output"
        );
        Ok(SlicedMemoryBinding {
            external_id: external_id.clone(),
            internal_id: internal_id.clone(),
            external,
            views,
            geometry,
            slice,
            start,
            linear_size: result.linear_size(),
            byte_stride: slice.stride * element_bytes,
            byte_offset: start * element_bytes,
            zero_copy,
        })
    }

    /// Points the binding at `external`, which has the layout of the memory
    /// it was created against. Aliasing views are re-derived; gather and
    /// scatter buffers are kept.
    pub fn repoint(&mut self, external: MemoryView) -> Result<(), ExecutionError> {
        if self.zero_copy {
            if let Some(layout) = self.views.first().map(|v| v.layout().clone()) {
                let views = (0..self.views.len() as i64)
                    .map(|i| {
                        let offset = self.slice.offset(self.start, i) as usize;
                        external
                            .subview(self.geometry.byte_offset(0, offset), layout.clone())
                            .map_err(ExecutionError::from)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.views = views;
            }
        }
        self.external = external;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn view(&self, iteration: i64) -> Option<&MemoryView> {
        usize::try_from(iteration).ok().and_then(|i| self.views.get(i))
    }

    /// View of iteration `iteration`, filling it from the outer memory first
    /// when the slices are strided. The returned event completes when the
    /// view holds the slice.
    pub fn prepare_input(
        &self,
        iteration: i64,
        stream: &dyn Stream,
    ) -> Option<(MemoryView, Option<Event>)> {
        let view = self.view(iteration)?.clone();
        if self.zero_copy {
            return Some((view, None));
        }
        let offset = self.slice.offset(self.start, iteration) as usize;
        let geometry = self.geometry;
        let external = self.external.clone();
        let target = view.clone();
        let event = stream.enqueue(
            &[],
            Box::new(move || geometry.gather(&external, offset, &target)),
        );
        Some((view, Some(event)))
    }

    /// Writes the first `iterations` views into the outer memory and returns
    /// the outer memory trimmed to the slots written.
    pub fn scatter(&self, iterations: i64) -> Result<MemoryView, ExecutionError> {
        let part = self.geometry.part as i64;
        let extent = concat_extent(&self.slice, part, iterations).ok_or_else(|| {
            ExecutionError::malformed(
                &self.external_id,
                format!("concatenation writes before the start of axis {}", self.slice.axis),
            )
        })?;
        let layout = self
            .external
            .layout()
            .with_dim(self.slice.axis, extent as usize)
            .ok_or_else(|| ExecutionError::malformed(&self.external_id, "concatenation axis out of range"))?;
        let trimmed = self.external.reinterpret(layout)?;
        if self.zero_copy {
            return Ok(trimmed);
        }

        let geometry = SliceGeometry {
            axis_len: extent as usize,
            ..self.geometry
        };
        let start = self.slice.resolved_start(iterations);
        for iteration in 0..iterations {
            let view = self.view(iteration).ok_or_else(|| ExecutionError::OutOfBoundIteration {
                loop_id: self.external_id.clone(),
                max_iteration: self.views.len() as i64,
            })?;
            let offset = self.slice.offset(start, iteration) as usize;
            geometry.scatter(view, offset, &trimmed)?;
        }
        Ok(trimmed)
    }
}

/// Extent of the iteration axis on the body side, after checking that the
/// outer memory and the body primitive agree on everything else. Inputs
/// must also hold at least one slice.
fn slice_part(
    internal_id: &PrimitiveId,
    external: &MemoryView,
    body: &Layout,
    slice: &AxisSlice,
    needs_slice: bool,
) -> Result<usize, ExecutionError> {
    let outer = external.layout();
    let part = body.dim(slice.axis);
    let fits = |p: usize| !needs_slice || outer.dim(slice.axis).is_some_and(|len| p <= len);
    let compatible = outer.data_type == body.data_type
        && outer.rank() == body.rank()
        && part.is_some_and(fits)
        && outer
            .shape
            .iter()
            .zip(&body.shape)
            .enumerate()
            .all(|(d, (o, b))| d == slice.axis || o == b);
    match part {
        Some(part) if compatible => Ok(part),
        _ => Err(ExecutionError::TypeMismatch {
            primitive: internal_id.clone(),
            expected: body.clone(),
            actual: outer.clone(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Backedges
// ---------------------------------------------------------------------------

/// Where the value a backedge carries lives between iterations.
#[derive(Debug, Clone)]
pub enum BackedgeSource {
    /// The source result is concatenated: iteration `i` reads the
    /// per-iteration view iteration `i - 1` wrote.
    Sliced { output: usize },
    /// Two buffers written alternately.
    PingPong { buffers: [MemoryView; 2] },
}

#[derive(Debug)]
pub struct BackedgeBinding {
    pub from_id: PrimitiveId,
    pub to_id: PrimitiveId,
    /// Value of `to_id` at iteration 0.
    pub initial: MemoryView,
    pub source: BackedgeSource,
}

impl BackedgeBinding {
    /// Memory `to_id` reads during `iteration`.
    pub fn input_for<'a>(
        &'a self,
        iteration: i64,
        outputs: &'a [SlicedMemoryBinding],
    ) -> Option<&'a MemoryView> {
        if iteration <= 0 {
            return Some(&self.initial);
        }
        match &self.source {
            BackedgeSource::Sliced { output } => outputs.get(*output)?.view(iteration - 1),
            BackedgeSource::PingPong { buffers } => Some(&buffers[((iteration - 1) % 2) as usize]),
        }
    }

    /// Memory `from_id` writes during `iteration`, when the backedge owns it.
    pub fn output_for(&self, iteration: i64) -> Option<&MemoryView> {
        match &self.source {
            BackedgeSource::Sliced { .. } => None,
            BackedgeSource::PingPong { buffers } => Some(&buffers[(iteration % 2) as usize]),
        }
    }
}

// ---------------------------------------------------------------------------
// Loop bindings
// ---------------------------------------------------------------------------

/// A non-concatenated output whose value is copied out after the last
/// iteration.
#[derive(Debug)]
pub struct FinalOutput {
    pub external_id: PrimitiveId,
    pub internal_id: PrimitiveId,
    pub external: MemoryView,
}

/// Everything a loop instance binds, and the outer memories it was bound
/// against.
#[derive(Debug, Default)]
pub struct LoopBindings {
    pub inputs: Vec<SlicedMemoryBinding>,
    pub outputs: Vec<SlicedMemoryBinding>,
    pub backedges: Vec<BackedgeBinding>,
    pub finals: Vec<FinalOutput>,
    pub(crate) bound_inputs: HashMap<PrimitiveId, MemoryView>,
    pub(crate) bound_outputs: HashMap<PrimitiveId, MemoryView>,
}

impl LoopBindings {
    /// Iterations the per-iteration views can serve, `None` without axis
    /// mappings.
    pub fn capacity(&self) -> Option<i64> {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .map(|b| b.len() as i64)
            .min()
    }

    /// Whether `io` holds the memories these bindings were created against.
    pub fn matches(&self, io: &LoopIo) -> bool {
        let inputs = self
            .bound_inputs
            .iter()
            .all(|(id, view)| io.input(id).is_some_and(|v| v.same_binding(view)));
        let outputs = self.bound_outputs.iter().all(|(id, view)| {
            io.output(id)
                .is_some_and(|v| v.shares_allocation(view) && v.byte_offset() == view.byte_offset())
        });
        inputs && outputs
    }

    /// Whether `io` can reuse these bindings once re-pointed: inputs keep
    /// their layouts and outputs the element type and size of their
    /// allocations.
    pub fn fits(&self, io: &LoopIo) -> bool {
        let inputs = self
            .bound_inputs
            .iter()
            .all(|(id, view)| io.input(id).is_some_and(|v| v.layout() == view.layout()));
        let outputs = self.bound_outputs.iter().all(|(id, view)| {
            io.output(id).is_some_and(|v| {
                v.layout().data_type == view.layout().data_type
                    && v.capacity() - v.byte_offset() == view.capacity() - view.byte_offset()
            })
        });
        inputs && outputs
    }

    /// Concatenated output whose body result is `internal_id`.
    pub fn output_index(&self, internal_id: &PrimitiveId) -> Option<usize> {
        self.outputs.iter().position(|b| &b.internal_id == internal_id)
    }

    pub fn backedge_from(&self, internal_id: &PrimitiveId) -> Option<&BackedgeBinding> {
        self.backedges.iter().find(|b| &b.from_id == internal_id)
    }
}

#[cfg(test)]
mod tests {
    use loopnet_core::types::{DataType, TensorValues};

    use super::*;
    use crate::stream::ImmediateStream;

    fn tensor(shape: &[usize], values: Vec<i64>) -> MemoryView {
        let view = MemoryView::allocate(Layout::new(DataType::I64, shape));
        view.fill(&TensorValues::Int(values)).unwrap();
        view
    }

    #[test]
    fn contiguous_input_slices_alias_the_outer_tensor() {
        let engine = Engine::default();
        let external = tensor(&[4, 2], (0..8).collect());
        let binding = SlicedMemoryBinding::for_input(
            &engine,
            &PrimitiveId::new("x"),
            &PrimitiveId::new("p"),
            AxisSlice::forward(0),
            external.clone(),
            &Layout::new(DataType::I64, &[1, 2]),
            -1,
        )
        .unwrap();
        assert!(binding.zero_copy);
        assert_eq!(binding.len(), 4);
        assert_eq!(engine.allocation_count(), 0);
        assert_eq!(binding.byte_stride, 16);

        let (view, event) = binding.prepare_input(2, &ImmediateStream).unwrap();
        assert!(event.is_none());
        assert!(view.shares_allocation(&external));
        assert_eq!(view.to_i64_vec(), vec![4, 5]);
        assert!(binding.prepare_input(4, &ImmediateStream).is_none());
    }

    #[test]
    fn strided_input_slices_are_gathered() {
        let engine = Engine::default();
        // [2, 3] sliced along axis 1, backwards.
        let external = tensor(&[2, 3], vec![1, 2, 3, 4, 5, 6]);
        let binding = SlicedMemoryBinding::for_input(
            &engine,
            &PrimitiveId::new("x"),
            &PrimitiveId::new("p"),
            AxisSlice::reverse(1),
            external,
            &Layout::new(DataType::I64, &[2, 1]),
            -1,
        )
        .unwrap();
        assert!(!binding.zero_copy);
        assert_eq!(binding.len(), 3);
        assert_eq!(binding.start, 2);

        let slices: Vec<Vec<i64>> = (0..3)
            .map(|i| {
                let (view, event) = binding.prepare_input(i, &ImmediateStream).unwrap();
                event.unwrap().wait().unwrap();
                view.to_i64_vec()
            })
            .collect();
        assert_eq!(slices, vec![vec![3, 6], vec![2, 5], vec![1, 4]]);
    }

    #[test]
    fn max_iteration_caps_input_slices() {
        let binding = SlicedMemoryBinding::for_input(
            &Engine::default(),
            &PrimitiveId::new("x"),
            &PrimitiveId::new("p"),
            AxisSlice::forward(0),
            tensor(&[6], (0..6).collect()),
            &Layout::new(DataType::I64, &[1]),
            2,
        )
        .unwrap();
        assert_eq!(binding.len(), 2);
    }

    #[test]
    fn negative_start_follows_max_iteration() {
        let engine = Engine::default();
        let binding = SlicedMemoryBinding::for_input(
            &engine,
            &PrimitiveId::new("x"),
            &PrimitiveId::new("p"),
            AxisSlice::reverse(0),
            tensor(&[6], (10..16).collect()),
            &Layout::new(DataType::I64, &[1]),
            3,
        )
        .unwrap();
        assert_eq!(binding.start, 2);
        assert_eq!(binding.len(), 3);
        let slices: Vec<i64> = (0..3)
            .map(|i| binding.prepare_input(i, &ImmediateStream).unwrap().0.read_int().unwrap())
            .collect();
        assert_eq!(slices, vec![12, 11, 10]);
    }

    #[test]
    fn repointed_inputs_alias_the_new_tensor() {
        let engine = Engine::default();
        let mut binding = SlicedMemoryBinding::for_input(
            &engine,
            &PrimitiveId::new("x"),
            &PrimitiveId::new("p"),
            AxisSlice::forward(0),
            tensor(&[3], vec![1, 2, 3]),
            &Layout::new(DataType::I64, &[1]),
            -1,
        )
        .unwrap();
        let replacement = tensor(&[3], vec![7, 8, 9]);
        binding.repoint(replacement.clone()).unwrap();

        let (view, _) = binding.prepare_input(1, &ImmediateStream).unwrap();
        assert!(view.shares_allocation(&replacement));
        assert_eq!(view.read_int().unwrap(), 8);
        assert_eq!(engine.allocation_count(), 0);
    }

    #[test]
    fn repointed_strided_inputs_keep_their_buffers() {
        let engine = Engine::default();
        let mut binding = SlicedMemoryBinding::for_input(
            &engine,
            &PrimitiveId::new("x"),
            &PrimitiveId::new("p"),
            AxisSlice::forward(1),
            tensor(&[2, 2], vec![1, 2, 3, 4]),
            &Layout::new(DataType::I64, &[2, 1]),
            -1,
        )
        .unwrap();
        let allocations = engine.allocation_count();
        binding.repoint(tensor(&[2, 2], vec![5, 6, 7, 8])).unwrap();
        assert_eq!(engine.allocation_count(), allocations);

        let (view, event) = binding.prepare_input(1, &ImmediateStream).unwrap();
        event.unwrap().wait().unwrap();
        assert_eq!(view.to_i64_vec(), vec![6, 8]);
    }

    #[test]
    fn mismatched_input_is_rejected() {
        let err = SlicedMemoryBinding::for_input(
            &Engine::default(),
            &PrimitiveId::new("x"),
            &PrimitiveId::new("p"),
            AxisSlice::forward(0),
            tensor(&[4, 2], (0..8).collect()),
            &Layout::new(DataType::I64, &[1, 3]),
            -1,
        )
        .unwrap_err();
        assert!(matches!(err, ExecutionError::TypeMismatch { .. }));
    }

    #[test]
    fn reverse_output_scatters_into_trimmed_tensor() {
        let engine = Engine::default();
        let external = MemoryView::allocate(Layout::new(DataType::I64, &[4]));
        let binding = SlicedMemoryBinding::for_output(
            &engine,
            &PrimitiveId::new("y"),
            &PrimitiveId::new("r"),
            AxisSlice::reverse(0),
            external,
            &Layout::new(DataType::I64, &[1]),
            4,
        )
        .unwrap();
        assert!(!binding.zero_copy);
        for i in 0..3 {
            binding.view(i).unwrap().write_int(10 + i).unwrap();
        }
        let published = binding.scatter(3).unwrap();
        assert_eq!(published.layout().shape.as_slice(), &[3]);
        assert_eq!(published.to_i64_vec(), vec![12, 11, 10]);
    }

    #[test]
    fn forward_output_writes_in_place() {
        let engine = Engine::default();
        let external = MemoryView::allocate(Layout::new(DataType::I64, &[3, 2]));
        let binding = SlicedMemoryBinding::for_output(
            &engine,
            &PrimitiveId::new("y"),
            &PrimitiveId::new("r"),
            AxisSlice::forward(0),
            external.clone(),
            &Layout::new(DataType::I64, &[1, 2]),
            3,
        )
        .unwrap();
        assert!(binding.zero_copy);
        binding
            .view(0)
            .unwrap()
            .fill(&TensorValues::Int(vec![1, 2]))
            .unwrap();
        binding
            .view(1)
            .unwrap()
            .fill(&TensorValues::Int(vec![3, 4]))
            .unwrap();
        let published = binding.scatter(2).unwrap();
        assert!(published.shares_allocation(&external));
        assert_eq!(published.layout().shape.as_slice(), &[2, 2]);
        assert_eq!(published.to_i64_vec(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn ping_pong_alternates_after_initial_value() {
        let layout = Layout::scalar(DataType::I64);
        let initial = MemoryView::allocate(layout.clone());
        let buffers = [
            MemoryView::allocate(layout.clone()),
            MemoryView::allocate(layout),
        ];
        let edge = BackedgeBinding {
            from_id: PrimitiveId::new("out"),
            to_id: PrimitiveId::new("acc"),
            initial: initial.clone(),
            source: BackedgeSource::PingPong {
                buffers: buffers.clone(),
            },
        };
        assert!(edge.input_for(0, &[]).unwrap().same_binding(&initial));
        assert!(edge.output_for(0).unwrap().same_binding(&buffers[0]));
        assert!(edge.input_for(1, &[]).unwrap().same_binding(&buffers[0]));
        assert!(edge.output_for(1).unwrap().same_binding(&buffers[1]));
        assert!(edge.input_for(2, &[]).unwrap().same_binding(&buffers[1]));
    }
}
