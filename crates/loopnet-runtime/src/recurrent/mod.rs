//! Recurrent executor: runs a compiled loop against outer memories.
//!
//! A [`RecurrentExecutor`] belongs to one loop node of one instantiated
//! [`Network`]. It owns a second network built from the loop's body program
//! and drives it iteration by iteration.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --bind--> Bound --run--> Running { i } --> Finalizing --> Idle
//!       ^                   ^                                              |
//!       |                   +------- next run, repointed if replaced -------+
//!       +------------- outer layouts changed, rebind -----------------------+
//! ```
//!
//! Binding happens on the first run and again only when an outer memory
//! changes layout. Outer memories replaced by others of the same layout, as
//! when an enclosing loop swaps its ping-pong buffers, are re-pointed in
//! place. Every per-iteration view is allocated during binding; iterating
//! and re-pointing allocate nothing.
//!
//! # One run
//!
//! 1. Read the trip count (negative: unbounded) and the initial condition.
//! 2. While `i < trip_count` (or unbounded) and the condition holds:
//!    bind slice `i` of every sliced input, bind backedge targets to the
//!    initial value (`i == 0`) or the value iteration `i - 1` produced, bind
//!    result views, submit the body, advance the iteration counter on the
//!    stream and read the continue condition.
//! 3. Wait for the body, scatter concatenated outputs, copy final values and
//!    write the iteration count.
//!
//! Iteration `i > 0` only waits on the events of the backedge sources and
//! the iteration counter of iteration `i - 1`.

pub mod binding;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use loopnet_core::id::PrimitiveId;
use loopnet_core::loop_desc::{ExecutionCondition, TripCount};
use loopnet_core::memory::MemoryView;
use loopnet_core::types::Layout;

use crate::config::NetworkConfig;
use crate::engine::Engine;
use crate::error::ExecutionError;
use crate::loop_builder::LoopNode;
use crate::network::{check_binding, Network};
use crate::stream::Event;
use crate::trace::IterationTrace;

pub use binding::{
    BackedgeBinding, BackedgeSource, FinalOutput, LoopBindings, SliceGeometry, SlicedMemoryBinding,
};

/// Where a loop instance is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Uninitialized,
    Bound,
    Running { iteration: i64 },
    Finalizing,
    Idle,
}

/// Outer memories of one loop invocation, keyed by outer primitive id.
#[derive(Debug, Clone, Default)]
pub struct LoopIo {
    inputs: HashMap<PrimitiveId, MemoryView>,
    outputs: HashMap<PrimitiveId, MemoryView>,
}

impl LoopIo {
    /// Pairs `inputs` with the loop's inputs and `outputs` with its output
    /// ports, both in port order.
    pub fn new(node: &LoopNode, inputs: Vec<MemoryView>, outputs: Vec<MemoryView>) -> Self {
        LoopIo {
            inputs: node.inputs.iter().cloned().zip(inputs).collect(),
            outputs: node.output_ids.iter().cloned().zip(outputs).collect(),
        }
    }

    pub fn input(&self, id: &PrimitiveId) -> Option<&MemoryView> {
        self.inputs.get(id)
    }

    pub fn output(&self, id: &PrimitiveId) -> Option<&MemoryView> {
        self.outputs.get(id)
    }
}

/// Result of one run.
#[derive(Debug)]
pub struct LoopRun {
    pub iterations: i64,
    /// Output ports whose memory is replaced by a new view of the same
    /// allocation: concatenated outputs trimmed to the slots written.
    pub published: Vec<(usize, MemoryView)>,
}

pub struct RecurrentExecutor<'p> {
    node: &'p LoopNode,
    engine: Arc<Engine>,
    body: Network<'p>,
    state: LoopState,
    bindings: Option<LoopBindings>,
    trace: Option<Vec<IterationTrace>>,
    last_iterations: Option<i64>,
}

impl<'p> RecurrentExecutor<'p> {
    pub fn new(
        node: &'p LoopNode,
        engine: Arc<Engine>,
        config: NetworkConfig,
    ) -> Result<Self, ExecutionError> {
        let trace = config.trace_enabled.then(Vec::new);
        let body = Network::new(&node.body, Arc::clone(&engine), config)?;
        Ok(RecurrentExecutor {
            node,
            engine,
            body,
            state: LoopState::Uninitialized,
            bindings: None,
            trace,
            last_iterations: None,
        })
    }

    pub fn node(&self) -> &'p LoopNode {
        self.node
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Iterations of the latest run, if tracing is enabled.
    pub fn trace(&self) -> Option<&[IterationTrace]> {
        self.trace.as_deref()
    }

    pub fn last_iterations(&self) -> Option<i64> {
        self.last_iterations
    }

    pub fn body(&self) -> &Network<'p> {
        &self.body
    }

    pub fn bindings(&self) -> Option<&LoopBindings> {
        self.bindings.as_ref()
    }

    /// Runs the loop to completion against `io`. `dependencies` are the
    /// events the first iteration waits on.
    #[tracing::instrument(skip_all, fields(loop_id = %self.node.id))]
    pub fn run(&mut self, io: &LoopIo, dependencies: &[Event]) -> Result<LoopRun, ExecutionError> {
        let bindings = match self.bindings.take() {
            Some(bindings) if bindings.matches(io) => bindings,
            Some(mut bindings) if bindings.fits(io) => {
                if let Err(err) = self.repoint(&mut bindings, io) {
                    self.state = LoopState::Uninitialized;
                    return Err(err);
                }
                bindings
            }
            _ => {
                self.state = LoopState::Uninitialized;
                self.bind(io)?
            }
        };
        self.state = LoopState::Bound;

        let result = self.iterate(&bindings, io, dependencies);
        self.bindings = Some(bindings);

        if result.is_err() {
            let _ = self.body.reset_execution();
            self.state = LoopState::Bound;
        }
        result
    }

    // -----------------------------------------------------------------------
    // Bind
    // -----------------------------------------------------------------------

    fn bind(&mut self, io: &LoopIo) -> Result<LoopBindings, ExecutionError> {
        let node = self.node;
        let desc = &node.desc;
        let max_iteration = node.max_iteration();
        let mut bindings = LoopBindings::default();

        let backedge_sources: HashSet<&PrimitiveId> =
            desc.back_edges.iter().map(|e| &e.from_internal_id).collect();
        let backedge_targets: HashSet<&PrimitiveId> =
            desc.back_edges.iter().map(|e| &e.to_internal_id).collect();
        let concat_sources: HashSet<&PrimitiveId> = desc
            .output_mappings
            .iter()
            .filter(|m| m.is_sliced())
            .map(|m| &m.internal_id)
            .collect();
        let mut direct = HashSet::new();

        for mapping in &desc.output_mappings {
            let view = outer(io.output(&mapping.external_id), node, &mapping.external_id)?;
            let layout = node
                .output_layout(mapping.external_id.as_str())
                .ok_or_else(|| unresolved(node, &mapping.external_id))?;
            let external = view.reinterpret(layout.clone())?;
            bindings
                .bound_outputs
                .insert(mapping.external_id.clone(), view.clone());
            let result = body_layout(node, &mapping.internal_id)?;

            match mapping.axis_slice() {
                Some(slice) => {
                    let binding = SlicedMemoryBinding::for_output(
                        &self.engine,
                        &mapping.external_id,
                        &mapping.internal_id,
                        slice,
                        external,
                        result,
                        max_iteration,
                    )?;
                    bindings.outputs.push(binding);
                }
                None => {
                    let direct_bind = !backedge_sources.contains(&mapping.internal_id)
                        && !concat_sources.contains(&mapping.internal_id)
                        && !self.is_body_source(&mapping.internal_id)
                        && direct.insert(&mapping.internal_id);
                    if direct_bind {
                        self.body
                            .set_output_memory(mapping.internal_id.as_str(), external)?;
                        tracing::debug!(
                            external_id = %mapping.external_id,
                            internal_id = %mapping.internal_id,
                            "bound output in place"
                        );
                    } else {
                        bindings.finals.push(FinalOutput {
                            external_id: mapping.external_id.clone(),
                            internal_id: mapping.internal_id.clone(),
                            external,
                        });
                    }
                }
            }
        }

        for mapping in &desc.input_mappings {
            let view = outer(io.input(&mapping.external_id), node, &mapping.external_id)?;
            bindings
                .bound_inputs
                .insert(mapping.external_id.clone(), view.clone());
            let parameter = body_layout(node, &mapping.internal_id)?;

            match mapping.axis_slice() {
                Some(slice) => {
                    let binding = SlicedMemoryBinding::for_input(
                        &self.engine,
                        &mapping.external_id,
                        &mapping.internal_id,
                        slice,
                        view.clone(),
                        parameter,
                        max_iteration,
                    )?;
                    bindings.inputs.push(binding);
                }
                // Bound per iteration from the backedge.
                None if backedge_targets.contains(&mapping.internal_id) => {}
                None => {
                    check_binding(&mapping.internal_id, parameter, view.layout())?;
                    let view = view.reinterpret(parameter.clone())?;
                    self.body.set_input_data(mapping.internal_id.as_str(), view)?;
                }
            }
        }

        for edge in &desc.back_edges {
            let from = body_layout(node, &edge.from_internal_id)?;
            let to = body_layout(node, &edge.to_internal_id)?;
            check_binding(&edge.to_internal_id, to, from)?;

            let mapping = desc
                .input_mappings_for(&edge.to_internal_id)
                .next()
                .ok_or_else(|| {
                    ExecutionError::malformed(
                        &node.id,
                        format!("backedge target '{}' has no initial value", edge.to_internal_id),
                    )
                })?;
            let initial = outer(io.input(&mapping.external_id), node, &mapping.external_id)?;
            check_binding(&edge.to_internal_id, to, initial.layout())?;
            let initial = initial.reinterpret(to.clone())?;

            let source = if let Some(output) = bindings.output_index(&edge.from_internal_id) {
                BackedgeSource::Sliced { output }
            } else if let Some(existing) = bindings.backedge_from(&edge.from_internal_id) {
                existing.source.clone()
            } else {
                BackedgeSource::PingPong {
                    buffers: [
                        self.engine.allocate(from.clone()),
                        self.engine.allocate(from.clone()),
                    ],
                }
            };
            bindings.backedges.push(BackedgeBinding {
                from_id: edge.from_internal_id.clone(),
                to_id: edge.to_internal_id.clone(),
                initial,
                source,
            });
        }

        tracing::debug!(
            sliced_inputs = bindings.inputs.len(),
            sliced_outputs = bindings.outputs.len(),
            back_edges = bindings.backedges.len(),
            final_outputs = bindings.finals.len(),
            "bound loop"
        );
        Ok(bindings)
    }

    /// Moves `bindings` onto the memories of `io`, which have the layouts
    /// they were bound with. Nothing is allocated.
    fn repoint(&mut self, bindings: &mut LoopBindings, io: &LoopIo) -> Result<(), ExecutionError> {
        let node = self.node;
        let desc = &node.desc;

        for mapping in &desc.output_mappings {
            let view = outer(io.output(&mapping.external_id), node, &mapping.external_id)?;
            let layout = node
                .output_layout(mapping.external_id.as_str())
                .ok_or_else(|| unresolved(node, &mapping.external_id))?;
            let external = view.reinterpret(layout.clone())?;
            bindings
                .bound_outputs
                .insert(mapping.external_id.clone(), view.clone());

            if mapping.is_sliced() {
                if let Some(binding) = bindings
                    .outputs
                    .iter_mut()
                    .find(|b| b.external_id == mapping.external_id)
                {
                    binding.repoint(external)?;
                }
            } else if let Some(output) = bindings
                .finals
                .iter_mut()
                .find(|f| f.external_id == mapping.external_id)
            {
                output.external = external;
            } else {
                self.body
                    .set_output_memory(mapping.internal_id.as_str(), external)?;
            }
        }

        for mapping in &desc.input_mappings {
            let view = outer(io.input(&mapping.external_id), node, &mapping.external_id)?;
            bindings
                .bound_inputs
                .insert(mapping.external_id.clone(), view.clone());

            if mapping.is_sliced() {
                if let Some(binding) = bindings.inputs.iter_mut().find(|b| {
                    b.external_id == mapping.external_id && b.internal_id == mapping.internal_id
                }) {
                    binding.repoint(view.clone())?;
                }
            } else if !bindings.backedges.iter().any(|e| e.to_id == mapping.internal_id) {
                let parameter = body_layout(node, &mapping.internal_id)?;
                let view = view.reinterpret(parameter.clone())?;
                self.body.set_input_data(mapping.internal_id.as_str(), view)?;
            }
        }

        for edge in &mut bindings.backedges {
            let to_id = edge.to_id.clone();
            let Some(mapping) = desc.input_mappings_for(&to_id).next() else {
                continue;
            };
            let initial = outer(io.input(&mapping.external_id), node, &mapping.external_id)?;
            let layout = edge.initial.layout().clone();
            edge.initial = initial.reinterpret(layout)?;
        }

        tracing::debug!("repointed loop bindings");
        Ok(())
    }

    fn is_body_source(&self, id: &PrimitiveId) -> bool {
        let graph = self.node.body.graph();
        graph
            .node_for(id.as_str())
            .and_then(|n| graph.node(n))
            .is_some_and(|n| n.op.is_source())
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    fn iterate(
        &mut self,
        bindings: &LoopBindings,
        io: &LoopIo,
        dependencies: &[Event],
    ) -> Result<LoopRun, ExecutionError> {
        let node = self.node;
        let desc = &node.desc;
        let stream = Arc::clone(self.engine.stream());

        let trip_count = match &desc.trip_count {
            TripCount::Static(count) => *count,
            TripCount::Dynamic(id) => outer(io.input(id), node, id)?.read_int()?,
        };
        let mut condition = match &desc.initial_condition {
            ExecutionCondition::Static(value) => *value,
            ExecutionCondition::Dynamic(id) => outer(io.input(id), node, id)?.get(0)?.is_truthy(),
        };

        let unbounded = trip_count < 0;
        let max_iteration = node.max_iteration();
        if unbounded && desc.condition_id.is_none() && max_iteration < 0 {
            return Err(ExecutionError::InvalidLoopBound {
                loop_id: node.id.clone(),
            });
        }
        let mut capacity = bindings.capacity();
        if unbounded && max_iteration >= 0 {
            capacity = Some(capacity.map_or(max_iteration, |c| c.min(max_iteration)));
        }
        let out_of_bound = |bound: i64| ExecutionError::OutOfBoundIteration {
            loop_id: node.id.clone(),
            max_iteration: bound,
        };

        let counter = match &desc.current_iteration_id {
            Some(id) => {
                let view = self.body.output_memory(id.as_str())?;
                view.write_int(0)?;
                Some(view)
            }
            None => None,
        };
        if let Some(trace) = &mut self.trace {
            trace.clear();
        }

        let mut deps = dependencies.to_vec();
        let mut copies = Vec::new();
        let mut counter_event = None;
        let mut iteration = 0;
        while (unbounded || iteration < trip_count) && condition {
            let bound = capacity.unwrap_or(i64::MAX);
            if iteration >= bound {
                return Err(out_of_bound(bound));
            }
            self.state = LoopState::Running { iteration };

            for input in &bindings.inputs {
                let (view, gathered) = input
                    .prepare_input(iteration, stream.as_ref())
                    .ok_or_else(|| out_of_bound(bound))?;
                self.body.set_input_data(input.internal_id.as_str(), view)?;
                deps.extend(gathered);
            }
            for edge in &bindings.backedges {
                let value = edge
                    .input_for(iteration, &bindings.outputs)
                    .ok_or_else(|| out_of_bound(bound))?;
                self.body.set_input_data(edge.to_id.as_str(), value.clone())?;
                if let Some(target) = edge.output_for(iteration) {
                    self.body
                        .set_output_memory(edge.from_id.as_str(), target.clone())?;
                }
            }
            for (index, output) in bindings.outputs.iter().enumerate() {
                if bindings.output_index(&output.internal_id) != Some(index) {
                    continue;
                }
                let view = output.view(iteration).ok_or_else(|| out_of_bound(bound))?;
                self.body
                    .set_output_memory(output.internal_id.as_str(), view.clone())?;
            }

            let waited_on = deps.len();
            let body_done = self.body.execute(&deps)?;
            tracing::trace!(iteration, dependencies = waited_on, "submitted loop body");

            // A result concatenated into several outputs is written to the
            // first one and copied to the others.
            for (index, output) in bindings.outputs.iter().enumerate() {
                let Some(primary) = bindings
                    .output_index(&output.internal_id)
                    .filter(|primary| *primary != index)
                else {
                    continue;
                };
                let source = bindings.outputs[primary]
                    .view(iteration)
                    .ok_or_else(|| out_of_bound(bound))?
                    .clone();
                let target = output.view(iteration).ok_or_else(|| out_of_bound(bound))?.clone();
                let produced: Vec<Event> = self
                    .body
                    .primitive_event(output.internal_id.as_str())
                    .into_iter()
                    .collect();
                copies.push(stream.enqueue(
                    &produced,
                    Box::new(move || target.copy_from(&source).map_err(ExecutionError::from)),
                ));
            }

            deps = bindings
                .backedges
                .iter()
                .filter_map(|edge| self.body.primitive_event(edge.from_id.as_str()))
                .collect();
            if let Some(view) = &counter {
                let view = view.clone();
                let event = stream.enqueue(
                    &[body_done],
                    Box::new(move || {
                        let current = view.read_int()?;
                        view.write_int(current + 1)?;
                        Ok(())
                    }),
                );
                deps.push(event.clone());
                counter_event = Some(event);
            }

            if let Some(id) = &desc.condition_id {
                if let Some(event) = self.body.primitive_event(id.as_str()) {
                    event.wait()?;
                }
                condition = self.body.output_memory(id.as_str())?.get(0)?.is_truthy();
            }
            if let Some(trace) = &mut self.trace {
                trace.push(IterationTrace {
                    iteration,
                    dependencies: waited_on,
                    continue_condition: condition,
                });
            }
            iteration += 1;
        }

        self.state = LoopState::Finalizing;
        self.body.reset_execution()?;
        Event::wait_all(&copies)?;
        if let Some(event) = counter_event {
            event.wait()?;
        }
        let run = self.finalize(bindings, io, iteration)?;
        self.last_iterations = Some(iteration);
        self.state = LoopState::Idle;
        tracing::debug!(iterations = iteration, "loop finished");
        Ok(run)
    }

    fn finalize(
        &self,
        bindings: &LoopBindings,
        io: &LoopIo,
        iterations: i64,
    ) -> Result<LoopRun, ExecutionError> {
        let node = self.node;
        let mut published = Vec::with_capacity(bindings.outputs.len());
        for output in &bindings.outputs {
            let view = output.scatter(iterations)?;
            if let Some(port) = node.output_ids.iter().position(|id| *id == output.external_id) {
                published.push((port, view));
            }
        }

        for output in &bindings.finals {
            if let Some(value) = self.last_value(bindings, &output.internal_id, iterations)? {
                output.external.copy_from(&value)?;
            }
        }

        if let Some(id) = &node.desc.num_iterations_id {
            outer(io.output(id), node, id)?.write_int(iterations)?;
        }
        Ok(LoopRun {
            iterations,
            published,
        })
    }

    /// Value of body result `internal_id` after `iterations` iterations.
    /// Results that do not feed a backedge keep the outer value when no
    /// iteration ran.
    fn last_value(
        &self,
        bindings: &LoopBindings,
        internal_id: &PrimitiveId,
        iterations: i64,
    ) -> Result<Option<MemoryView>, ExecutionError> {
        if let Some(edge) = bindings.backedge_from(internal_id) {
            return Ok(edge.input_for(iterations, &bindings.outputs).cloned());
        }
        if iterations == 0 {
            return Ok(None);
        }
        if let Some(index) = bindings.output_index(internal_id) {
            return Ok(bindings.outputs[index].view(iterations - 1).cloned());
        }
        self.body.output_memory(internal_id.as_str()).map(Some)
    }
}

fn outer<'a>(
    view: Option<&'a MemoryView>,
    node: &LoopNode,
    id: &PrimitiveId,
) -> Result<&'a MemoryView, ExecutionError> {
    view.ok_or_else(|| unresolved(node, id))
}

fn unresolved(node: &LoopNode, id: &PrimitiveId) -> ExecutionError {
    ExecutionError::malformed(&node.id, format!("'{}' is not bound to the loop", id))
}

fn body_layout<'n>(node: &'n LoopNode, id: &PrimitiveId) -> Result<&'n Layout, ExecutionError> {
    node.body_layout(id.as_str()).ok_or_else(|| {
        ExecutionError::malformed(&node.id, format!("'{}' is not a primitive of the loop body", id))
    })
}
