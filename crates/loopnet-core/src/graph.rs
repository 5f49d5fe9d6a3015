//! ProgramGraph: the dependency graph built from a [`Topology`].
//!
//! [`ProgramGraph`] resolves every input id of every primitive to a
//! `(producer node, output port)` pair once, stores the result as data
//! edges in a petgraph `StableGraph`, and keeps two id-indexed maps so
//! that later passes never scan the graph by name:
//!
//! - `nodes_by_id`: primitive id -> node,
//! - `output_ports`: output id (including `"{id}:{k}"` ports) -> `(node, port)`.
//!
//! # Processing order
//!
//! [`ProgramGraph::processing_order`] is a topological order that, among
//! ready nodes, always picks the one inserted first. The result is therefore
//! deterministic and matches the topology order whenever that order is
//! already valid.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::stable_graph::StableGraph;
use petgraph::visit::EdgeRef;
use petgraph::Directed;
use petgraph::Direction;

use crate::edge::DataEdge;
use crate::error::CoreError;
use crate::id::{NodeId, PrimitiveId};
use crate::ops::PrimitiveOp;
use crate::topology::{Primitive, Topology};

/// A primitive placed in the program graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramNode {
    pub id: PrimitiveId,
    /// Input ids in port order.
    pub inputs: Vec<PrimitiveId>,
    /// Output ids in port order; `outputs[0] == id`.
    pub outputs: Vec<PrimitiveId>,
    pub op: PrimitiveOp,
}

/// One resolved input of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Producer {
    pub target_port: u16,
    pub node: NodeId,
    pub source_port: u16,
}

/// Dependency graph of one topology.
#[derive(Debug, Clone)]
pub struct ProgramGraph {
    graph: StableGraph<ProgramNode, DataEdge, Directed, u32>,
    nodes_by_id: HashMap<PrimitiveId, NodeId>,
    output_ports: HashMap<PrimitiveId, (NodeId, u16)>,
}

impl ProgramGraph {
    /// Builds the graph, resolving every input reference.
    ///
    /// Fails with [`CoreError::DuplicatePrimitive`] when two output ports
    /// share an id and with [`CoreError::UnknownInput`] when an input names
    /// no output port.
    pub fn from_topology(topology: &Topology) -> Result<Self, CoreError> {
        let mut graph = StableGraph::<ProgramNode, DataEdge, Directed, u32>::new();
        let mut nodes_by_id = HashMap::new();
        let mut output_ports = HashMap::new();

        for primitive in topology.primitives() {
            let outputs = primitive.op.output_ids(&primitive.id);
            let node = NodeId::from(graph.add_node(ProgramNode {
                id: primitive.id.clone(),
                inputs: primitive.inputs.clone(),
                outputs: outputs.clone(),
                op: primitive.op.clone(),
            }));
            nodes_by_id.insert(primitive.id.clone(), node);
            for (port, output) in outputs.into_iter().enumerate() {
                if output_ports.contains_key(&output) {
                    return Err(CoreError::DuplicatePrimitive { id: output });
                }
                output_ports.insert(output, (node, port as u16));
            }
        }

        let mut program = ProgramGraph {
            graph,
            nodes_by_id,
            output_ports,
        };

        let nodes: Vec<NodeId> = program.node_ids().collect();
        for node in nodes {
            let (id, inputs) = match program.node(node) {
                Some(n) => (n.id.clone(), n.inputs.clone()),
                None => continue,
            };
            for (target_port, input) in inputs.iter().enumerate() {
                let (source, source_port) = program.output_port(input.as_str()).ok_or_else(|| {
                    CoreError::UnknownInput {
                        id: input.clone(),
                        referenced_by: id.clone(),
                    }
                })?;
                program.graph.add_edge(
                    source.into(),
                    node.into(),
                    DataEdge {
                        source_port,
                        target_port: target_port as u16,
                    },
                );
            }
        }

        Ok(program)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&ProgramNode> {
        self.graph.node_weight(id.into())
    }

    /// Node of the primitive named `id`.
    pub fn node_for(&self, id: &str) -> Option<NodeId> {
        self.nodes_by_id.get(id).copied()
    }

    /// Node and port producing the output named `id`.
    pub fn output_port(&self, id: &str) -> Option<(NodeId, u16)> {
        self.output_ports.get(id).copied()
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.node_indices().map(NodeId::from)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &ProgramNode)> + '_ {
        self.graph
            .node_indices()
            .filter_map(move |idx| self.graph.node_weight(idx).map(|n| (NodeId::from(idx), n)))
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Resolved inputs of `node`, sorted by input port.
    pub fn producers(&self, node: NodeId) -> Vec<Producer> {
        let mut producers: Vec<Producer> = self
            .graph
            .edges_directed(node.into(), Direction::Incoming)
            .map(|edge| Producer {
                target_port: edge.weight().target_port,
                node: NodeId::from(edge.source()),
                source_port: edge.weight().source_port,
            })
            .collect();
        producers.sort_by_key(|p| p.target_port);
        producers
    }

    /// Nodes reading any output of `node`, without duplicates.
    pub fn consumers(&self, node: NodeId) -> Vec<NodeId> {
        let mut consumers: Vec<NodeId> = self
            .graph
            .edges_directed(node.into(), Direction::Outgoing)
            .map(|edge| NodeId::from(edge.target()))
            .collect();
        consumers.sort();
        consumers.dedup();
        consumers
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Replaces a node's operation in place, returning the old op. The new
    /// op must expose the same output ids.
    pub fn replace_op(&mut self, node: NodeId, op: PrimitiveOp) -> Result<PrimitiveOp, CoreError> {
        let weight = self
            .graph
            .node_weight_mut(node.into())
            .ok_or_else(|| CoreError::PrimitiveNotFound {
                id: PrimitiveId::new(format!("#{}", node)),
            })?;
        if op.output_ids(&weight.id) != weight.outputs {
            return Err(CoreError::DuplicatePrimitive {
                id: weight.id.clone(),
            });
        }
        Ok(std::mem::replace(&mut weight.op, op))
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    /// Topological order of all nodes, preferring insertion order among
    /// ready nodes. Fails with [`CoreError::CycleDetected`] on a cycle.
    pub fn processing_order(&self) -> Result<Vec<NodeId>, CoreError> {
        let mut pending: HashMap<NodeId, usize> = self
            .node_ids()
            .map(|node| {
                let count = self
                    .graph
                    .edges_directed(node.into(), Direction::Incoming)
                    .count();
                (node, count)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeId>> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| Reverse(*node))
            .collect();

        let mut order = Vec::with_capacity(self.node_count());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for edge in self.graph.edges_directed(node.into(), Direction::Outgoing) {
                let target = NodeId::from(edge.target());
                if let Some(count) = pending.get_mut(&target) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse(target));
                    }
                }
            }
        }

        if order.len() < self.node_count() {
            let stuck = self
                .node_ids()
                .find(|node| pending.get(node).is_some_and(|&count| count > 0));
            let id = stuck
                .and_then(|node| self.node(node))
                .map(|n| n.id.clone())
                .unwrap_or_else(|| PrimitiveId::new("?"));
            return Err(CoreError::CycleDetected { id });
        }
        Ok(order)
    }

    /// Rebuilds a topology from the current nodes in insertion order.
    pub fn to_topology(&self) -> Result<Topology, CoreError> {
        let mut topology = Topology::new();
        for (_, node) in self.nodes() {
            topology.add(Primitive::new(
                node.id.clone(),
                node.inputs.clone(),
                node.op.clone(),
            ))?;
        }
        Ok(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{ActivationFunction, EltwiseMode};
    use crate::types::{DataType, Layout, TensorValues};

    fn f32_input(id: &str) -> Primitive {
        Primitive::input_layout(id, Layout::new(DataType::F32, &[2]))
    }

    fn ids(graph: &ProgramGraph, order: &[NodeId]) -> Vec<String> {
        order
            .iter()
            .map(|n| graph.node(*n).unwrap().id.to_string())
            .collect()
    }

    #[test]
    fn resolves_inputs_to_edges() {
        let topology = Topology::new()
            .with(f32_input("a"))
            .unwrap()
            .with(f32_input("b"))
            .unwrap()
            .with(Primitive::eltwise("sum", "a", "b", EltwiseMode::Sum))
            .unwrap();
        let graph = ProgramGraph::from_topology(&topology).unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);

        let sum = graph.node_for("sum").unwrap();
        let producers = graph.producers(sum);
        assert_eq!(producers.len(), 2);
        assert_eq!(producers[0].node, graph.node_for("a").unwrap());
        assert_eq!(producers[1].node, graph.node_for("b").unwrap());
        assert_eq!(graph.consumers(graph.node_for("a").unwrap()), vec![sum]);
    }

    #[test]
    fn same_input_twice_keeps_both_ports() {
        let topology = Topology::new()
            .with(f32_input("a"))
            .unwrap()
            .with(Primitive::eltwise("sq", "a", "a", EltwiseMode::Prod))
            .unwrap();
        let graph = ProgramGraph::from_topology(&topology).unwrap();
        let sq = graph.node_for("sq").unwrap();
        let ports: Vec<u16> = graph.producers(sq).iter().map(|p| p.target_port).collect();
        assert_eq!(ports, vec![0, 1]);
        assert_eq!(graph.consumers(graph.node_for("a").unwrap()).len(), 1);
    }

    #[test]
    fn unknown_input_errors() {
        let topology = Topology::new()
            .with(Primitive::activation("r", "missing", ActivationFunction::Relu))
            .unwrap();
        let err = ProgramGraph::from_topology(&topology).unwrap_err();
        assert_eq!(
            err,
            CoreError::UnknownInput {
                id: PrimitiveId::new("missing"),
                referenced_by: PrimitiveId::new("r"),
            }
        );
    }

    #[test]
    fn processing_order_prefers_insertion_order() {
        // "late" is inserted before its input "x".
        let topology = Topology::new()
            .with(Primitive::activation("late", "x", ActivationFunction::Relu))
            .unwrap()
            .with(f32_input("x"))
            .unwrap()
            .with(Primitive::data(
                "c",
                Layout::new(DataType::F32, &[2]),
                TensorValues::Float(vec![1.0, 2.0]),
            ))
            .unwrap();
        let graph = ProgramGraph::from_topology(&topology).unwrap();
        let order = graph.processing_order().unwrap();
        assert_eq!(ids(&graph, &order), vec!["x", "late", "c"]);
    }

    #[test]
    fn cycle_is_detected() {
        let topology = Topology::new()
            .with(Primitive::activation("a", "b", ActivationFunction::Relu))
            .unwrap()
            .with(Primitive::activation("b", "a", ActivationFunction::Relu))
            .unwrap();
        let graph = ProgramGraph::from_topology(&topology).unwrap();
        assert!(matches!(
            graph.processing_order(),
            Err(CoreError::CycleDetected { .. })
        ));
    }

    #[test]
    fn to_topology_roundtrip() {
        let topology = Topology::new()
            .with(f32_input("a"))
            .unwrap()
            .with(Primitive::activation("r", "a", ActivationFunction::Abs))
            .unwrap();
        let graph = ProgramGraph::from_topology(&topology).unwrap();
        assert_eq!(graph.to_topology().unwrap(), topology);
    }

    #[test]
    fn replace_op_keeps_outputs() {
        let topology = Topology::new()
            .with(f32_input("a"))
            .unwrap()
            .with(Primitive::activation("r", "a", ActivationFunction::Abs))
            .unwrap();
        let mut graph = ProgramGraph::from_topology(&topology).unwrap();
        let r = graph.node_for("r").unwrap();
        let old = graph
            .replace_op(
                r,
                PrimitiveOp::Activation {
                    function: ActivationFunction::Relu,
                },
            )
            .unwrap();
        assert_eq!(
            old,
            PrimitiveOp::Activation {
                function: ActivationFunction::Abs
            }
        );
    }
}
