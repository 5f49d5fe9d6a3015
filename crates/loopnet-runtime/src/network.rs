//! Network: one instantiation of a compiled [`Program`].
//!
//! A network owns one memory view per output port of every node and the
//! completion event of every node's latest submission. It serves both as
//! the top-level executable and as the body sub-program of a loop: the loop
//! executor rebinds parameter and result memories between iterations with
//! [`Network::set_input_data`] and [`Network::set_output_memory`].
//!
//! # Execution
//!
//! [`Network::execute`] walks the processing order once:
//!
//! - source nodes run nothing;
//! - kernel nodes are enqueued on the engine's stream, capturing the views
//!   bound at submission time, and wait on the events of their producers
//!   (plus the caller's dependencies when they read a source);
//! - loop nodes wait for their inputs on the host and run their
//!   [`RecurrentExecutor`] synchronously.
//!
//! The returned event completes when every submission of the pass has.

use std::collections::HashMap;
use std::sync::Arc;

use loopnet_core::id::{NodeId, PrimitiveId};
use loopnet_core::memory::MemoryView;
use loopnet_core::ops::PrimitiveOp;
use loopnet_core::types::Layout;

use crate::config::NetworkConfig;
use crate::engine::Engine;
use crate::error::ExecutionError;
use crate::program::{Implementation, Program};
use crate::recurrent::{LoopIo, LoopState, RecurrentExecutor};
use crate::stream::Event;
use crate::trace::IterationTrace;

pub struct Network<'p> {
    program: &'p Program,
    engine: Arc<Engine>,
    config: NetworkConfig,
    memories: HashMap<NodeId, Vec<MemoryView>>,
    events: HashMap<NodeId, Event>,
    loops: HashMap<NodeId, RecurrentExecutor<'p>>,
    executions: u64,
}

impl<'p> Network<'p> {
    /// Allocates memory for every output port and fills constant data.
    pub fn new(
        program: &'p Program,
        engine: Arc<Engine>,
        config: NetworkConfig,
    ) -> Result<Self, ExecutionError> {
        let mut memories = HashMap::new();
        let mut loops = HashMap::new();

        for &node_id in program.processing_order() {
            let (Some(node), Some(compiled)) = (program.graph().node(node_id), program.compiled(node_id))
            else {
                continue;
            };
            let views: Vec<MemoryView> = compiled
                .layouts
                .iter()
                .map(|layout| engine.allocate(layout.clone()))
                .collect();

            if let PrimitiveOp::Data { values, .. } | PrimitiveOp::MutableData { values, .. } = &node.op {
                if let Some(view) = views.first().filter(|_| !values.is_empty()) {
                    view.fill(values)?;
                }
            }
            if let Implementation::Loop(loop_node) = &compiled.implementation {
                let executor = RecurrentExecutor::new(loop_node, Arc::clone(&engine), config.clone())?;
                loops.insert(node_id, executor);
            }
            memories.insert(node_id, views);
        }

        Ok(Network {
            program,
            engine,
            config,
            memories,
            events: HashMap::new(),
            loops,
            executions: 0,
        })
    }

    pub fn program(&self) -> &'p Program {
        self.program
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Number of completed [`execute`](Self::execute) calls.
    pub fn executions(&self) -> u64 {
        self.executions
    }

    // -----------------------------------------------------------------------
    // Binding
    // -----------------------------------------------------------------------

    /// Binds `view` as the memory of the source primitive `id`.
    pub fn set_input_data(&mut self, id: &str, view: MemoryView) -> Result<(), ExecutionError> {
        let (node, port) = self.port(id)?;
        let is_source = self
            .program
            .graph()
            .node(node)
            .is_some_and(|n| n.op.is_source());
        if !is_source {
            return Err(ExecutionError::malformed(
                &PrimitiveId::new(id),
                "not an input, data or mutable_data primitive",
            ));
        }
        self.bind(id, node, port, view)
    }

    /// Binds `view` as the memory the output `id` is written to.
    pub fn set_output_memory(&mut self, id: &str, view: MemoryView) -> Result<(), ExecutionError> {
        let (node, port) = self.port(id)?;
        self.bind(id, node, port, view)
    }

    fn bind(&mut self, id: &str, node: NodeId, port: u16, view: MemoryView) -> Result<(), ExecutionError> {
        let primitive = PrimitiveId::new(id);
        let expected = self
            .program
            .compiled(node)
            .and_then(|c| c.layouts.get(port as usize))
            .ok_or_else(|| ExecutionError::malformed(&primitive, "output has no compiled layout"))?;
        check_binding(&primitive, expected, view.layout())?;
        let slot = self
            .memories
            .get_mut(&node)
            .and_then(|views| views.get_mut(port as usize))
            .ok_or_else(|| ExecutionError::malformed(&primitive, "output has no memory"))?;
        *slot = view;
        Ok(())
    }

    fn port(&self, id: &str) -> Result<(NodeId, u16), ExecutionError> {
        self.program
            .graph()
            .output_port(id)
            .ok_or_else(|| ExecutionError::malformed(&PrimitiveId::new(id), "no such primitive"))
    }

    fn memory(&self, node: NodeId, port: u16) -> Result<MemoryView, ExecutionError> {
        self.memories
            .get(&node)
            .and_then(|views| views.get(port as usize))
            .cloned()
            .ok_or_else(|| {
                let id = self
                    .program
                    .graph()
                    .node(node)
                    .map_or_else(|| PrimitiveId::new(format!("#{}", node)), |n| n.id.clone());
                ExecutionError::malformed(&id, format!("no memory for port {}", port))
            })
    }

    /// Memory currently bound to the output `id`, without waiting.
    pub fn output_memory(&self, id: &str) -> Result<MemoryView, ExecutionError> {
        let (node, port) = self.port(id)?;
        self.memory(node, port)
    }

    /// Waits for the producer of `id` and returns its memory.
    pub fn get_output(&self, id: &str) -> Result<MemoryView, ExecutionError> {
        if let Some(event) = self.primitive_event(id) {
            event.wait()?;
        }
        self.output_memory(id)
    }

    /// Event of the latest submission producing `id`, if any.
    pub fn primitive_event(&self, id: &str) -> Option<Event> {
        let (node, _) = self.program.graph().output_port(id)?;
        self.events.get(&node).cloned()
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Submits every node once. Nodes reading source memory wait on
    /// `dependencies`.
    pub fn execute(&mut self, dependencies: &[Event]) -> Result<Event, ExecutionError> {
        let program = self.program;
        let stream = Arc::clone(self.engine.stream());
        let mut submitted = Vec::new();

        for &node_id in program.processing_order() {
            let Some(compiled) = program.compiled(node_id) else {
                continue;
            };
            match &compiled.implementation {
                Implementation::Source => {}
                Implementation::Kernel(kernel) => {
                    let (inputs, deps) = self.gather_inputs(node_id, dependencies)?;
                    let output = self.memory(node_id, 0)?;
                    let kernel = Arc::clone(kernel);
                    let event = stream.enqueue(&deps, Box::new(move || kernel.execute(&inputs, &output)));
                    self.events.insert(node_id, event.clone());
                    submitted.push(event);
                }
                Implementation::Loop(loop_node) => {
                    let (inputs, deps) = self.gather_inputs(node_id, dependencies)?;
                    Event::wait_all(&deps)?;
                    // Readers of the previous results must be done before the
                    // executor writes its outputs on the host.
                    for consumer in program.graph().consumers(node_id) {
                        if let Some(event) = self.events.get(&consumer) {
                            event.wait()?;
                        }
                    }

                    let outputs = self
                        .memories
                        .get(&node_id)
                        .cloned()
                        .unwrap_or_default();
                    let io = LoopIo::new(loop_node, inputs, outputs);
                    let executor = self
                        .loops
                        .get_mut(&node_id)
                        .ok_or_else(|| ExecutionError::malformed(&loop_node.id, "loop was not instantiated"))?;
                    let run = executor.run(&io, &deps)?;

                    if let Some(views) = self.memories.get_mut(&node_id) {
                        for (port, view) in run.published {
                            if let Some(slot) = views.get_mut(port) {
                                *slot = view;
                            }
                        }
                    }
                    let event = Event::completed();
                    self.events.insert(node_id, event.clone());
                    submitted.push(event);
                }
            }
        }

        self.executions += 1;
        tracing::trace!(submissions = submitted.len(), "network executed");
        Ok(stream.enqueue(&submitted, Box::new(|| Ok(()))))
    }

    /// Input views of `node` in port order, and the events to wait on.
    fn gather_inputs(
        &self,
        node: NodeId,
        dependencies: &[Event],
    ) -> Result<(Vec<MemoryView>, Vec<Event>), ExecutionError> {
        let producers = self.program.graph().producers(node);
        let mut inputs = Vec::with_capacity(producers.len());
        let mut deps = Vec::new();
        let mut reads_source = false;
        for producer in producers {
            inputs.push(self.memory(producer.node, producer.source_port)?);
            match self.events.get(&producer.node) {
                Some(event) => deps.push(event.clone()),
                None => reads_source = true,
            }
        }
        if reads_source {
            deps.extend_from_slice(dependencies);
        }
        Ok((inputs, deps))
    }

    /// Waits for every outstanding submission and forgets the events.
    /// Returns the first failure.
    pub fn reset_execution(&mut self) -> Result<(), ExecutionError> {
        let mut first = None;
        for event in self.events.values() {
            if let Err(err) = event.wait() {
                first.get_or_insert(err);
            }
        }
        self.events.clear();
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Executes with no external dependencies and waits for completion.
    pub fn run(&mut self) -> Result<(), ExecutionError> {
        let done = self.execute(&[])?;
        done.wait()
    }

    // -----------------------------------------------------------------------
    // Loop inspection
    // -----------------------------------------------------------------------

    fn executor(&self, id: &str) -> Option<&RecurrentExecutor<'p>> {
        let node = self.program.graph().node_for(id)?;
        self.loops.get(&node)
    }

    pub fn loop_state(&self, id: &str) -> Option<LoopState> {
        self.executor(id).map(RecurrentExecutor::state)
    }

    /// Iteration trace of the latest run of loop `id`, when tracing is on.
    pub fn loop_trace(&self, id: &str) -> Option<&[IterationTrace]> {
        self.executor(id)?.trace()
    }

    /// Iterations executed by the latest run of loop `id`.
    pub fn last_iterations(&self, id: &str) -> Option<i64> {
        self.executor(id)?.last_iterations()
    }
}

/// Checks that a memory of layout `actual` can stand in for `expected`:
/// same element type and element count.
pub(crate) fn check_binding(
    primitive: &PrimitiveId,
    expected: &Layout,
    actual: &Layout,
) -> Result<(), ExecutionError> {
    if expected.data_type != actual.data_type || expected.linear_size() != actual.linear_size() {
        return Err(ExecutionError::TypeMismatch {
            primitive: primitive.clone(),
            expected: expected.clone(),
            actual: actual.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use loopnet_core::ops::EltwiseMode;
    use loopnet_core::topology::{Primitive, Topology};
    use loopnet_core::types::{DataType, TensorValues};

    use super::*;
    use crate::config::{EngineConfig, QueueKind};

    fn add_program() -> Program {
        let topology = Topology::new()
            .with(Primitive::input_layout("a", Layout::new(DataType::I64, &[3])))
            .unwrap()
            .with(Primitive::data(
                "b",
                Layout::new(DataType::I64, &[3]),
                TensorValues::Int(vec![10, 20, 30]),
            ))
            .unwrap()
            .with(Primitive::eltwise("sum", "a", "b", EltwiseMode::Sum))
            .unwrap();
        Program::compile_with_reference_kernels(&topology).unwrap()
    }

    fn input(values: Vec<i64>) -> MemoryView {
        let view = MemoryView::allocate(Layout::new(DataType::I64, &[values.len()]));
        view.fill(&TensorValues::Int(values)).unwrap();
        view
    }

    #[test]
    fn executes_kernels_in_order() {
        let program = add_program();
        for queue in [QueueKind::Immediate, QueueKind::InOrder] {
            let engine = Arc::new(Engine::new(EngineConfig { queue }));
            let mut network = Network::new(&program, engine, NetworkConfig::default()).unwrap();
            network.set_input_data("a", input(vec![1, 2, 3])).unwrap();
            network.run().unwrap();
            assert_eq!(network.get_output("sum").unwrap().to_i64_vec(), vec![11, 22, 33]);
            assert_eq!(network.executions(), 1);
        }
    }

    #[test]
    fn output_memory_can_be_rebound() {
        let program = add_program();
        let mut network =
            Network::new(&program, Arc::new(Engine::default()), NetworkConfig::default()).unwrap();
        let target = MemoryView::allocate(Layout::new(DataType::I64, &[3]));
        network.set_output_memory("sum", target.clone()).unwrap();
        network.set_input_data("a", input(vec![0, 0, 1])).unwrap();
        network.run().unwrap();
        assert_eq!(target.to_i64_vec(), vec![10, 20, 31]);
    }

    #[test]
    fn binding_checks_layout() {
        let program = add_program();
        let mut network =
            Network::new(&program, Arc::new(Engine::default()), NetworkConfig::default()).unwrap();
        let wrong = MemoryView::allocate(Layout::new(DataType::F32, &[3]));
        assert!(matches!(
            network.set_input_data("a", wrong),
            Err(ExecutionError::TypeMismatch { .. })
        ));
        assert!(matches!(
            network.set_input_data("sum", input(vec![1, 2, 3])),
            Err(ExecutionError::MalformedGraph { .. })
        ));
        assert!(network.output_memory("nope").is_err());
    }

    #[test]
    fn reset_execution_clears_events() {
        let program = add_program();
        let mut network =
            Network::new(&program, Arc::new(Engine::default()), NetworkConfig::default()).unwrap();
        network.run().unwrap();
        assert!(network.primitive_event("sum").is_some());
        network.reset_execution().unwrap();
        assert!(network.primitive_event("sum").is_none());
        assert!(network.primitive_event("a").is_none());
    }
}
