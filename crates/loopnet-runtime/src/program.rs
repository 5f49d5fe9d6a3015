//! Program compilation.
//!
//! [`Program::compile`] turns a [`Topology`] into something a
//! [`Network`](crate::network::Network) can execute:
//!
//! 1. Build the [`ProgramGraph`], resolving every input id once.
//! 2. Compute the processing order.
//! 3. Walk the order, inferring output layouts and choosing implementations:
//!    - source primitives keep their declared layout and run nothing,
//!    - `Iterate` primitives are lowered to `Loop` by the loop builder,
//!    - `Loop` primitives compile their body recursively,
//!    - compute primitives go through layout inference and the
//!      [`ImplementationSelector`].
//!
//! Loop bodies are compiled with the same selector and options as the
//! enclosing program.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use loopnet_check::infer_output_layout;
use loopnet_core::error::CoreError;
use loopnet_core::graph::{ProgramGraph, ProgramNode};
use loopnet_core::id::{NodeId, PrimitiveId};
use loopnet_core::ops::PrimitiveOp;
use loopnet_core::topology::Topology;
use loopnet_core::types::Layout;

use crate::config::CompileOptions;
use crate::error::CompileError;
use crate::kernels::{ImplementationSelector, Kernel, ReferenceSelector};
use crate::loop_builder::{self, LoopNode};

/// What runs for one node.
#[derive(Debug)]
pub enum Implementation {
    /// Input, constant or mutable data; owns memory, runs nothing.
    Source,
    Kernel(Arc<dyn Kernel>),
    Loop(Box<LoopNode>),
}

/// Compile result of one node.
#[derive(Debug)]
pub struct CompiledNode {
    /// Output layouts in port order.
    pub layouts: Vec<Layout>,
    pub implementation: Implementation,
}

/// Settings shared by a program and every loop body nested in it.
#[derive(Clone)]
pub struct CompileContext {
    selector: Arc<dyn ImplementationSelector>,
    options: CompileOptions,
    enclosing_loops: Vec<PrimitiveId>,
}

impl CompileContext {
    pub fn new(selector: Arc<dyn ImplementationSelector>, options: CompileOptions) -> Self {
        CompileContext {
            selector,
            options,
            enclosing_loops: Vec::new(),
        }
    }

    pub fn selector(&self) -> &Arc<dyn ImplementationSelector> {
        &self.selector
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Number of loop bodies enclosing the topology being compiled.
    pub fn depth(&self) -> usize {
        self.enclosing_loops.len()
    }

    /// Context for compiling the body of `loop_id`.
    pub(crate) fn enter_loop(&self, loop_id: &PrimitiveId) -> Result<CompileContext, CompileError> {
        self.check_not_enclosing(loop_id)?;
        if self.depth() >= self.options.max_loop_depth {
            return Err(CompileError::malformed(
                loop_id,
                format!(
                    "loop nesting exceeds the maximum depth of {}",
                    self.options.max_loop_depth
                ),
            ));
        }
        let mut nested = self.clone();
        nested.enclosing_loops.push(loop_id.clone());
        Ok(nested)
    }

    fn check_not_enclosing(&self, loop_id: &PrimitiveId) -> Result<(), CompileError> {
        if self.enclosing_loops.contains(loop_id) {
            return Err(CompileError::malformed(
                loop_id,
                "loop body refers to an enclosing loop",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for CompileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileContext")
            .field("options", &self.options)
            .field("enclosing_loops", &self.enclosing_loops)
            .finish_non_exhaustive()
    }
}

/// A compiled topology.
#[derive(Debug)]
pub struct Program {
    graph: ProgramGraph,
    order: Vec<NodeId>,
    compiled: HashMap<NodeId, CompiledNode>,
}

impl Program {
    /// Compiles `topology`, choosing kernels through `selector`.
    pub fn compile(
        topology: &Topology,
        selector: Arc<dyn ImplementationSelector>,
        options: &CompileOptions,
    ) -> Result<Program, CompileError> {
        let context = CompileContext::new(selector, options.clone());
        Program::compile_in(topology, &context)
    }

    /// Compiles `topology` with the host reference kernels and default
    /// options.
    pub fn compile_with_reference_kernels(topology: &Topology) -> Result<Program, CompileError> {
        Program::compile(
            topology,
            Arc::new(ReferenceSelector),
            &CompileOptions::default(),
        )
    }

    pub(crate) fn compile_in(
        topology: &Topology,
        context: &CompileContext,
    ) -> Result<Program, CompileError> {
        let mut graph = ProgramGraph::from_topology(topology).map_err(graph_error)?;
        let order = graph.processing_order().map_err(graph_error)?;
        tracing::debug!(
            primitives = graph.node_count(),
            depth = context.depth(),
            "compiling topology"
        );

        let mut compiled: HashMap<NodeId, CompiledNode> = HashMap::with_capacity(order.len());
        for &node_id in &order {
            let node = match graph.node(node_id) {
                Some(node) => node.clone(),
                None => continue,
            };
            let inputs = input_layouts(&graph, &compiled, node_id, &node)?;

            let entry = match &node.op {
                op if op.is_source() => CompiledNode {
                    layouts: vec![infer_output_layout(&node.id, op, &inputs)?],
                    implementation: Implementation::Source,
                },
                PrimitiveOp::Iterate(desc) => {
                    let loop_node = loop_builder::lower_iterate(&node, desc, &inputs, context)?;
                    compiled_loop(&mut graph, node_id, loop_node)?
                }
                PrimitiveOp::Loop(desc) => {
                    let loop_node = loop_builder::compile_loop(&node, desc, &inputs, context)?;
                    compiled_loop(&mut graph, node_id, loop_node)?
                }
                op => {
                    let layout = infer_output_layout(&node.id, op, &inputs)?;
                    let kernel = context
                        .selector
                        .choose_implementation(&node, &inputs, &layout)?;
                    tracing::trace!(primitive = %node.id, kernel = kernel.name(), "selected kernel");
                    CompiledNode {
                        layouts: vec![layout],
                        implementation: Implementation::Kernel(kernel),
                    }
                }
            };
            compiled.insert(node_id, entry);
        }

        Ok(Program {
            graph,
            order,
            compiled,
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn graph(&self) -> &ProgramGraph {
        &self.graph
    }

    pub fn processing_order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn compiled(&self, node: NodeId) -> Option<&CompiledNode> {
        self.compiled.get(&node)
    }

    /// Layout of the output named `id`.
    pub fn layout(&self, id: &str) -> Option<&Layout> {
        let (node, port) = self.graph.output_port(id)?;
        self.compiled.get(&node)?.layouts.get(port as usize)
    }

    /// The compiled loop named `id`.
    pub fn loop_node(&self, id: &str) -> Option<&LoopNode> {
        let node = self.graph.node_for(id)?;
        match &self.compiled.get(&node)?.implementation {
            Implementation::Loop(loop_node) => Some(loop_node.as_ref()),
            _ => None,
        }
    }

    /// Every top-level loop in processing order.
    pub fn loop_nodes(&self) -> impl Iterator<Item = &LoopNode> + '_ {
        self.order
            .iter()
            .filter_map(move |node| match &self.compiled.get(node)?.implementation {
                Implementation::Loop(loop_node) => Some(loop_node.as_ref()),
                _ => None,
            })
    }

    /// Ids of the `InputLayout` primitives, in processing order.
    pub fn input_ids(&self) -> Vec<PrimitiveId> {
        self.order
            .iter()
            .filter_map(|node| self.graph.node(*node))
            .filter(|node| matches!(node.op, PrimitiveOp::InputLayout { .. }))
            .map(|node| node.id.clone())
            .collect()
    }

    /// The topology with every `Iterate` replaced by its `Loop` lowering.
    pub fn lowered_topology(&self) -> Result<Topology, CoreError> {
        self.graph.to_topology()
    }
}

fn compiled_loop(
    graph: &mut ProgramGraph,
    node_id: NodeId,
    loop_node: LoopNode,
) -> Result<CompiledNode, CompileError> {
    graph
        .replace_op(node_id, PrimitiveOp::Loop(Box::new(loop_node.desc.clone())))
        .map_err(graph_error)?;
    Ok(CompiledNode {
        layouts: loop_node.output_layouts.clone(),
        implementation: Implementation::Loop(Box::new(loop_node)),
    })
}

fn input_layouts(
    graph: &ProgramGraph,
    compiled: &HashMap<NodeId, CompiledNode>,
    node_id: NodeId,
    node: &ProgramNode,
) -> Result<Vec<Layout>, CompileError> {
    graph
        .producers(node_id)
        .into_iter()
        .map(|producer| {
            compiled
                .get(&producer.node)
                .and_then(|c| c.layouts.get(producer.source_port as usize))
                .cloned()
                .ok_or_else(|| {
                    let input = node
                        .inputs
                        .get(producer.target_port as usize)
                        .map_or_else(|| "?".to_string(), |id| id.to_string());
                    CompileError::malformed(&node.id, format!("input '{}' has no layout", input))
                })
        })
        .collect()
}

/// Graph construction failures are structural problems of the topology.
fn graph_error(err: CoreError) -> CompileError {
    let primitive = match &err {
        CoreError::UnknownInput { referenced_by, .. } => referenced_by.clone(),
        CoreError::DuplicatePrimitive { id }
        | CoreError::CycleDetected { id }
        | CoreError::PrimitiveNotFound { id } => id.clone(),
        _ => return CompileError::Core(err),
    };
    CompileError::MalformedGraph {
        primitive,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use loopnet_core::ops::{ActivationFunction, EltwiseMode};
    use loopnet_core::topology::Primitive;
    use loopnet_core::types::{DataType, TensorValues};

    use super::*;
    use crate::error::KernelError;

    fn compile(topology: &Topology) -> Result<Program, CompileError> {
        Program::compile_with_reference_kernels(topology)
    }

    #[test]
    fn infers_layouts_in_order() {
        let topology = Topology::new()
            .with(Primitive::input_layout("x", Layout::new(DataType::F32, &[3])))
            .unwrap()
            .with(Primitive::data(
                "two",
                Layout::scalar(DataType::F32),
                TensorValues::Float(vec![2.0]),
            ))
            .unwrap()
            .with(Primitive::eltwise("y", "x", "two", EltwiseMode::Prod))
            .unwrap()
            .with(Primitive::activation("z", "y", ActivationFunction::Relu))
            .unwrap();
        let program = compile(&topology).unwrap();
        assert_eq!(program.processing_order().len(), 4);
        assert_eq!(program.layout("z"), Some(&Layout::new(DataType::F32, &[3])));
        assert_eq!(program.input_ids(), vec![PrimitiveId::new("x")]);
        assert!(program.loop_nodes().next().is_none());
    }

    #[test]
    fn unknown_input_is_malformed() {
        let topology = Topology::new()
            .with(Primitive::activation("r", "ghost", ActivationFunction::Abs))
            .unwrap();
        match compile(&topology).unwrap_err() {
            CompileError::MalformedGraph { primitive, .. } => assert_eq!(primitive.as_str(), "r"),
            other => panic!("expected MalformedGraph, got {:?}", other),
        }
    }

    #[test]
    fn cycle_is_malformed() {
        let topology = Topology::new()
            .with(Primitive::activation("a", "b", ActivationFunction::Abs))
            .unwrap()
            .with(Primitive::activation("b", "a", ActivationFunction::Abs))
            .unwrap();
        assert!(matches!(
            compile(&topology),
            Err(CompileError::MalformedGraph { .. })
        ));
    }

    #[test]
    fn selector_errors_surface_unchanged() {
        let topology = Topology::new()
            .with(Primitive::input_layout("x", Layout::scalar(DataType::I32)))
            .unwrap()
            .with(Primitive::activation("t", "x", ActivationFunction::Tanh))
            .unwrap();
        assert_eq!(
            compile(&topology).unwrap_err(),
            CompileError::NoImplementationFound(KernelError::NoImplementationFound {
                primitive: PrimitiveId::new("t"),
                op: "activation".to_string(),
                data_type: DataType::I32,
            })
        );
    }

    #[test]
    fn layout_errors_are_wrapped() {
        let topology = Topology::new()
            .with(Primitive::input_layout("a", Layout::scalar(DataType::I64)))
            .unwrap()
            .with(Primitive::input_layout("b", Layout::scalar(DataType::F32)))
            .unwrap()
            .with(Primitive::eltwise("s", "a", "b", EltwiseMode::Sum))
            .unwrap();
        assert!(matches!(compile(&topology), Err(CompileError::Layout(_))));
    }
}
