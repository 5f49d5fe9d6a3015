//! Loop node construction.
//!
//! Two entry points, both called by the program compiler:
//!
//! - [`lower_iterate`] rewrites a structured `Iterate` primitive into a
//!   [`LoopDesc`]: indices become primitive ids, merged inputs become an
//!   initial-value mapping plus a backedge, and outputs take the node's
//!   port ids (`id`, `id:1`, ...).
//! - [`compile_loop`] accepts a `Loop` primitive written directly.
//!
//! Both compile the body recursively and then run the same validation,
//! producing a [`LoopNode`]: the descriptor, the compiled body and the
//! layouts of the loop's outputs.
//!
//! # Backedge conversion
//!
//! When a backedge carries a result of a different element type than the
//! parameter it feeds, the builder inserts a `Convert` primitive named
//! `"{result}:convert_{type}"` into the body, redirects the backedge to it
//! and recompiles the body. Lossy conversions are logged as warnings.
//!
//! # Iteration bound
//!
//! `max_iteration` is the static trip count if it is non-negative, else the
//! declared `max_iterations`, else the number of slices the first sliced
//! input provides, else `-1`. Axis mappings require a bound.

use std::collections::HashSet;

use loopnet_check::{can_convert, check_axis, check_control_scalar, is_lossless, LayoutError};
use loopnet_core::graph::ProgramNode;
use loopnet_core::id::PrimitiveId;
use loopnet_core::loop_desc::{InputKind, IterateDesc, LoopDesc, OutputKind, TripCount};
use loopnet_core::mapping::{AxisSlice, BackedgeMapping, InputMapping, OutputMapping};
use loopnet_core::ops::PrimitiveOp;
use loopnet_core::topology::{Primitive, Topology};
use loopnet_core::types::{DataType, Layout};

use crate::error::CompileError;
use crate::program::{CompileContext, Program};

/// A compiled loop: its descriptor and its compiled body.
#[derive(Debug)]
pub struct LoopNode {
    pub id: PrimitiveId,
    /// The loop primitive's inputs in port order.
    pub inputs: Vec<PrimitiveId>,
    pub desc: LoopDesc,
    pub body: Program,
    /// Output ids in port order, `id` first.
    pub output_ids: Vec<PrimitiveId>,
    pub output_layouts: Vec<Layout>,
}

impl LoopNode {
    pub fn max_iteration(&self) -> i64 {
        self.desc.max_iteration
    }

    /// Layout of the loop output named `id`.
    pub fn output_layout(&self, id: &str) -> Option<&Layout> {
        let port = self.output_ids.iter().position(|o| o.as_str() == id)?;
        self.output_layouts.get(port)
    }

    /// Compiled layout of the body primitive named `id`.
    pub fn body_layout(&self, id: &str) -> Option<&Layout> {
        self.body.layout(id)
    }
}

// ---------------------------------------------------------------------------
// Iterate lowering
// ---------------------------------------------------------------------------

/// Lowers an `Iterate` primitive to a loop.
pub(crate) fn lower_iterate(
    node: &ProgramNode,
    desc: &IterateDesc,
    input_layouts: &[Layout],
    context: &CompileContext,
) -> Result<LoopNode, CompileError> {
    let id = &node.id;
    let parameter = |index: usize| {
        desc.body.parameters.get(index).cloned().ok_or_else(|| {
            CompileError::malformed(id, format!("body parameter index {} out of range", index))
        })
    };
    let result = |index: usize| {
        desc.body.results.get(index).cloned().ok_or_else(|| {
            CompileError::malformed(id, format!("body result index {} out of range", index))
        })
    };
    let external = |index: usize| {
        node.inputs.get(index).cloned().ok_or_else(|| {
            CompileError::malformed(id, format!("input index {} out of range", index))
        })
    };

    // Step 1: compile the body.
    let body_context = context.enter_loop(id)?;
    let mut body_topology = desc.body.topology.clone();
    let mut body = Program::compile_in(&body_topology, &body_context)?;
    for name in desc.body.parameters.iter().chain(&desc.body.results) {
        body_layout(&body, id, name)?;
    }

    // Step 2: input mappings and backedges.
    let mut input_mappings = Vec::with_capacity(desc.inputs.len());
    let mut back_edges = Vec::new();
    for input in &desc.inputs {
        let outer = external(input.external)?;
        let inner = parameter(input.parameter)?;
        match input.kind {
            InputKind::Invariant => input_mappings.push(InputMapping::invariant(outer, inner)),
            InputKind::Sliced(slice) => {
                input_mappings.push(InputMapping::sliced(outer, inner, slice))
            }
            InputKind::Merged { result: index } => {
                input_mappings.push(InputMapping::invariant(outer, inner.clone()));
                back_edges.push(BackedgeMapping::new(result(index)?, inner));
            }
        }
    }

    // Step 3: reconcile backedge element types.
    let mut converted = false;
    for edge in &mut back_edges {
        let from = body_layout(&body, id, &edge.from_internal_id)?.clone();
        let to = body_layout(&body, id, &edge.to_internal_id)?.clone();
        if from.data_type == to.data_type {
            continue;
        }
        if !can_convert(&from, &to) {
            return Err(backedge_mismatch(id, edge, from, to));
        }
        let convert_id = insert_convert(&mut body_topology, id, &edge.from_internal_id, to.data_type)?;
        if is_lossless(from.data_type, to.data_type) {
            tracing::debug!(loop_id = %id, %convert_id, "inserted backedge conversion");
        } else {
            tracing::warn!(
                loop_id = %id,
                %convert_id,
                from = %from.data_type,
                to = %to.data_type,
                "backedge conversion may lose precision"
            );
        }
        edge.from_internal_id = convert_id;
        converted = true;
    }
    if converted {
        body = Program::compile_in(&body_topology, &body_context)?;
    }

    // Step 4: output mappings on the node's ports.
    let output_mappings: Vec<OutputMapping> = desc
        .outputs
        .iter()
        .enumerate()
        .map(|(k, output)| {
            let inner = result(output.result)?;
            Ok(match output.kind {
                OutputKind::Final => OutputMapping::final_value(id.port(k), inner),
                OutputKind::Concat(slice) => OutputMapping::concatenated(id.port(k), inner, slice),
            })
        })
        .collect::<Result<_, CompileError>>()?;

    let current_iteration_id = desc.current_iteration.map(|i| parameter(i)).transpose()?;
    let condition_id = desc.condition.map(|i| result(i)).transpose()?;

    // Step 5: iteration bound.
    let max_iteration = derive_max_iteration(
        &desc.trip_count,
        desc.max_iterations,
        &input_mappings,
        node,
        input_layouts,
        &body,
    );

    let lowered = LoopDesc {
        body: body_topology,
        trip_count: desc.trip_count.clone(),
        initial_condition: desc.initial_condition.clone(),
        max_iteration,
        input_mappings,
        output_mappings,
        back_edges,
        current_iteration_id,
        condition_id,
        num_iterations_id: desc.num_iterations_id(id),
    };
    tracing::debug!(
        loop_id = %id,
        max_iteration,
        inputs = lowered.input_mappings.len(),
        outputs = lowered.output_mappings.len(),
        back_edges = lowered.back_edges.len(),
        "lowered iterate to loop"
    );

    finish_loop(node, lowered, input_layouts, body)
}

/// Adds `"{result}:convert_{type}"` to the body unless an identical
/// conversion is already there.
fn insert_convert(
    topology: &mut Topology,
    loop_id: &PrimitiveId,
    result: &PrimitiveId,
    data_type: DataType,
) -> Result<PrimitiveId, CompileError> {
    let convert_id = result.with_suffix(&format!("convert_{}", data_type.name()));
    let convert = Primitive::convert(convert_id.clone(), result.clone(), data_type);
    match topology.get(convert_id.as_str()) {
        None => topology.add(convert)?,
        Some(existing) if *existing == convert => {}
        Some(_) => {
            return Err(CompileError::malformed(
                loop_id,
                format!("body already defines '{}'", convert_id),
            ))
        }
    }
    Ok(convert_id)
}

fn derive_max_iteration(
    trip_count: &TripCount,
    declared: Option<i64>,
    input_mappings: &[InputMapping],
    node: &ProgramNode,
    input_layouts: &[Layout],
    body: &Program,
) -> i64 {
    if let TripCount::Static(count) = trip_count {
        if *count >= 0 {
            return *count;
        }
    }
    if let Some(bound) = declared.filter(|b| *b >= 0) {
        return bound;
    }

    for mapping in input_mappings {
        let Some(slice) = mapping.axis_slice() else {
            continue;
        };
        let outer = node
            .inputs
            .iter()
            .position(|i| *i == mapping.external_id)
            .and_then(|port| input_layouts.get(port));
        let inner = body.layout(mapping.internal_id.as_str());
        if let (Some(outer), Some(inner)) = (outer, inner) {
            if let (Some(axis_len), Some(part)) = (outer.dim(slice.axis), inner.dim(slice.axis)) {
                return slice_count(&slice, axis_len, part, -1);
            }
        }
    }
    -1
}

/// Start offset of a sliced input. A negative `start` resolves against
/// `max_iteration` when that is known, else to the last slice of the axis.
pub(crate) fn input_start(slice: &AxisSlice, axis_len: usize, part: usize, max_iteration: i64) -> i64 {
    if slice.start >= 0 {
        slice.start
    } else if max_iteration >= 0 {
        slice.resolved_start(max_iteration)
    } else {
        axis_len as i64 - part as i64
    }
}

/// Number of slices `slice` yields on an axis of `axis_len` elements.
/// `end` bounds forward slicing from above and backward slicing from below.
pub(crate) fn slice_count(slice: &AxisSlice, axis_len: usize, part: usize, max_iteration: i64) -> i64 {
    let len = axis_len as i64;
    let width = part as i64;
    let start = input_start(slice, axis_len, part, max_iteration);
    if slice.stride > 0 {
        let limit = if slice.end < 0 {
            len + 1 + slice.end
        } else {
            slice.end.min(len)
        };
        slice.slots_within(start.max(0), limit.max(0) as usize, part)
    } else if slice.stride < 0 {
        let floor = slice.end.max(0);
        if start < floor || start + width > len {
            0
        } else {
            (start - floor) / -slice.stride + 1
        }
    } else {
        -1
    }
}

// ---------------------------------------------------------------------------
// Loop compilation
// ---------------------------------------------------------------------------

/// Compiles a `Loop` primitive written directly in a topology.
pub(crate) fn compile_loop(
    node: &ProgramNode,
    desc: &LoopDesc,
    input_layouts: &[Layout],
    context: &CompileContext,
) -> Result<LoopNode, CompileError> {
    let body_context = context.enter_loop(&node.id)?;
    let body = Program::compile_in(&desc.body, &body_context)?;
    let mut desc = desc.clone();
    if desc.max_iteration < 0 {
        desc.max_iteration = derive_max_iteration(
            &desc.trip_count,
            None,
            &desc.input_mappings,
            node,
            input_layouts,
            &body,
        );
    }
    finish_loop(node, desc, input_layouts, body)
}

/// Validates a loop against its compiled body and computes its output
/// layouts.
fn finish_loop(
    node: &ProgramNode,
    mut desc: LoopDesc,
    input_layouts: &[Layout],
    body: Program,
) -> Result<LoopNode, CompileError> {
    let id = &node.id;
    let outer_layout = |outer: &PrimitiveId| {
        node.inputs
            .iter()
            .position(|i| i == outer)
            .and_then(|port| input_layouts.get(port))
            .ok_or_else(|| {
                CompileError::malformed(id, format!("'{}' is not an input of the loop", outer))
            })
    };

    // Control inputs.
    for control in desc.control_inputs() {
        check_control_scalar(control, outer_layout(control)?)?;
    }

    // Input mappings.
    for mapping in &desc.input_mappings {
        let outer = outer_layout(&mapping.external_id)?;
        check_body_source(&body, id, &mapping.internal_id)?;
        let inner = body_layout(&body, id, &mapping.internal_id)?;
        match mapping.axis_slice() {
            Some(slice) => check_sliced_input(id, mapping, &slice, outer, inner)?,
            None => {
                if outer.data_type != inner.data_type || outer.linear_size() != inner.linear_size() {
                    return Err(CompileError::malformed(
                        id,
                        format!(
                            "input '{}' ({}) does not match body parameter '{}' ({})",
                            mapping.external_id, outer, mapping.internal_id, inner
                        ),
                    ));
                }
            }
        }
    }

    // Iteration signals.
    if let Some(counter) = &desc.current_iteration_id {
        check_body_source(&body, id, counter)?;
        let layout = body_layout(&body, id, counter)?;
        check_control_scalar(counter, layout)?;
        if !layout.data_type.is_integer() {
            return Err(LayoutError::InvalidControlScalar {
                primitive: counter.clone(),
                layout: layout.clone(),
            }
            .into());
        }
    }
    if let Some(condition) = &desc.condition_id {
        check_control_scalar(condition, body_layout(&body, id, condition)?)?;
    }

    // Backedges.
    let mut targets = HashSet::new();
    for edge in &desc.back_edges {
        let from = body_layout(&body, id, &edge.from_internal_id)?;
        let to = body_layout(&body, id, &edge.to_internal_id)?;
        let initial: Vec<&InputMapping> = desc.input_mappings_for(&edge.to_internal_id).collect();
        if initial.len() != 1 || initial[0].is_sliced() {
            return Err(CompileError::malformed(
                id,
                format!(
                    "backedge target '{}' needs exactly one whole-tensor input mapping",
                    edge.to_internal_id
                ),
            ));
        }
        if !targets.insert(&edge.to_internal_id) {
            return Err(CompileError::malformed(
                id,
                format!("'{}' is the target of more than one backedge", edge.to_internal_id),
            ));
        }
        if from.data_type != to.data_type || from.linear_size() != to.linear_size() {
            return Err(backedge_mismatch(id, edge, from.clone(), to.clone()));
        }
    }

    if desc.has_axis_mapping() && desc.max_iteration < 0 {
        return Err(CompileError::InvalidLoopBound {
            loop_id: id.clone(),
        });
    }

    // Outputs.
    let produces_own = desc.output_mappings.iter().any(|m| m.external_id == *id)
        || desc.num_iterations_id.as_ref() == Some(id);
    if !produces_own {
        return Err(CompileError::malformed(
            id,
            "no output mapping produces the loop's own id",
        ));
    }

    let output_ids = desc.output_ids(id);
    let mut output_layouts = Vec::with_capacity(output_ids.len());
    for output in &output_ids {
        let mut mappings = desc.output_mappings.iter().filter(|m| m.external_id == *output);
        let is_count = desc.num_iterations_id.as_ref() == Some(output);
        let layout = match (mappings.next(), is_count) {
            (None, true) => Layout::scalar(DataType::I64),
            (Some(mapping), false) => {
                if mappings.next().is_some() {
                    return Err(CompileError::malformed(
                        id,
                        format!("loop output '{}' is mapped more than once", output),
                    ));
                }
                let inner = body_layout(&body, id, &mapping.internal_id)?;
                match mapping.axis_slice() {
                    Some(slice) => concat_layout(id, mapping, &slice, inner, desc.max_iteration)?,
                    None => inner.clone(),
                }
            }
            _ => {
                return Err(CompileError::malformed(
                    id,
                    format!("loop output '{}' is both mapped and the iteration count", output),
                ))
            }
        };
        output_layouts.push(layout);
    }

    desc.body = body.lowered_topology()?;
    tracing::debug!(
        loop_id = %id,
        max_iteration = desc.max_iteration,
        outputs = output_ids.len(),
        "compiled loop"
    );

    Ok(LoopNode {
        id: id.clone(),
        inputs: node.inputs.clone(),
        desc,
        body,
        output_ids,
        output_layouts,
    })
}

fn body_layout<'b>(
    body: &'b Program,
    loop_id: &PrimitiveId,
    internal: &PrimitiveId,
) -> Result<&'b Layout, CompileError> {
    body.layout(internal.as_str()).ok_or_else(|| {
        CompileError::malformed(
            loop_id,
            format!("'{}' is not a primitive of the loop body", internal),
        )
    })
}

/// Body parameters must be memory the executor can rebind.
fn check_body_source(
    body: &Program,
    loop_id: &PrimitiveId,
    internal: &PrimitiveId,
) -> Result<(), CompileError> {
    let is_source = body
        .graph()
        .node_for(internal.as_str())
        .and_then(|n| body.graph().node(n))
        .is_some_and(|n| {
            matches!(
                n.op,
                PrimitiveOp::InputLayout { .. } | PrimitiveOp::MutableData { .. }
            )
        });
    if !is_source {
        return Err(CompileError::malformed(
            loop_id,
            format!(
                "body parameter '{}' must be an input_layout or mutable_data primitive",
                internal
            ),
        ));
    }
    Ok(())
}

fn check_sliced_input(
    loop_id: &PrimitiveId,
    mapping: &InputMapping,
    slice: &AxisSlice,
    outer: &Layout,
    inner: &Layout,
) -> Result<(), CompileError> {
    check_axis(&mapping.external_id, slice.axis, outer)?;
    check_axis(&mapping.internal_id, slice.axis, inner)?;
    if slice.stride == 0 {
        return Err(CompileError::malformed(
            loop_id,
            format!("sliced input '{}' has a zero stride", mapping.external_id),
        ));
    }
    if !same_except_axis(outer, inner, slice.axis) {
        return Err(CompileError::malformed(
            loop_id,
            format!(
                "sliced input '{}' ({}) does not match body parameter '{}' ({})",
                mapping.external_id, outer, mapping.internal_id, inner
            ),
        ));
    }
    Ok(())
}

/// Same element type and rank, same dims except `axis`, and the inner
/// extent along `axis` no larger than the outer one.
fn same_except_axis(outer: &Layout, inner: &Layout, axis: usize) -> bool {
    outer.data_type == inner.data_type
        && outer.rank() == inner.rank()
        && outer
            .shape
            .iter()
            .zip(inner.shape.iter())
            .enumerate()
            .all(|(d, (o, i))| if d == axis { i <= o } else { i == o })
}

/// Layout of a concatenated output when `max_iteration` iterations run.
fn concat_layout(
    loop_id: &PrimitiveId,
    mapping: &OutputMapping,
    slice: &AxisSlice,
    inner: &Layout,
    max_iteration: i64,
) -> Result<Layout, CompileError> {
    check_axis(&mapping.internal_id, slice.axis, inner)?;
    if slice.stride == 0 {
        return Err(CompileError::malformed(
            loop_id,
            format!("concatenated output '{}' has a zero stride", mapping.external_id),
        ));
    }
    let part = inner.dim(slice.axis).unwrap_or(0) as i64;
    let extent = concat_extent(slice, part, max_iteration).ok_or_else(|| {
        CompileError::malformed(
            loop_id,
            format!(
                "concatenated output '{}' writes before the start of axis {}",
                mapping.external_id, slice.axis
            ),
        )
    })?;
    inner
        .with_dim(slice.axis, extent as usize)
        .ok_or_else(|| CompileError::malformed(loop_id, "concatenation axis out of range"))
}

/// Axis extent covered by `iterations` slices of width `part`, or `None`
/// if a slice would start at a negative offset.
pub(crate) fn concat_extent(slice: &AxisSlice, part: i64, iterations: i64) -> Option<i64> {
    if iterations <= 0 {
        return Some(0);
    }
    let start = slice.resolved_start(iterations);
    let first = slice.offset(start, 0);
    let last = slice.offset(start, iterations - 1);
    if first.min(last) < 0 {
        return None;
    }
    Some(first.max(last) + part)
}

fn backedge_mismatch(
    loop_id: &PrimitiveId,
    edge: &BackedgeMapping,
    from_layout: Layout,
    to_layout: Layout,
) -> CompileError {
    CompileError::TypeMismatch {
        loop_id: loop_id.clone(),
        from: edge.from_internal_id.clone(),
        to: edge.to_internal_id.clone(),
        from_layout,
        to_layout,
    }
}
