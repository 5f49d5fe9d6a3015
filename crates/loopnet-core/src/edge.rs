//! Edge type of the program graph.
//!
//! Every edge is a data dependency: the target primitive reads output port
//! `source_port` of the source primitive on its input port `target_port`.
//! There are no control edges; loops are expressed by nesting a body
//! topology inside a loop primitive, never by cycles in the graph.

use serde::{Deserialize, Serialize};

/// Data dependency between two primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEdge {
    /// Which output port of the source node (most nodes have port 0 only).
    pub source_port: u16,
    /// Which input port of the target node.
    pub target_port: u16,
}
