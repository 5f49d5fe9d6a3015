//! Identifier newtypes for topology primitives and program graph nodes.
//!
//! A [`PrimitiveId`] is the user-facing string name of a primitive (or of
//! one of its output ports) and is unique within one topology. A [`NodeId`]
//! is the compact index of a node in a compiled [`ProgramGraph`](crate::graph::ProgramGraph).

use std::borrow::Borrow;
use std::fmt;

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

/// Stable node identifier. Maps to a petgraph `NodeIndex<u32>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Name of a primitive, or of one output port of a multi-output primitive.
///
/// Port 0 of a primitive reuses the primitive's own id; port `k > 0` is
/// addressed as `"{id}:{k}"` (see [`PrimitiveId::port`]).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimitiveId(String);

impl PrimitiveId {
    pub fn new(id: impl Into<String>) -> Self {
        PrimitiveId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of output port `index` of this primitive.
    pub fn port(&self, index: usize) -> PrimitiveId {
        if index == 0 {
            self.clone()
        } else {
            PrimitiveId(format!("{}:{}", self.0, index))
        }
    }

    /// Derived id `"{self}:{suffix}"`, used for primitives generated on
    /// behalf of this one.
    pub fn with_suffix(&self, suffix: &str) -> PrimitiveId {
        PrimitiveId(format!("{}:{}", self.0, suffix))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PrimitiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrimitiveId {
    fn from(id: &str) -> Self {
        PrimitiveId(id.to_string())
    }
}

impl From<String> for PrimitiveId {
    fn from(id: String) -> Self {
        PrimitiveId(id)
    }
}

impl From<&PrimitiveId> for PrimitiveId {
    fn from(id: &PrimitiveId) -> Self {
        id.clone()
    }
}

impl Borrow<str> for PrimitiveId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// Bridge between NodeId and petgraph's NodeIndex<u32>.

impl From<NodeIndex<u32>> for NodeId {
    fn from(idx: NodeIndex<u32>) -> Self {
        NodeId(idx.index() as u32)
    }
}

impl From<NodeId> for NodeIndex<u32> {
    fn from(id: NodeId) -> Self {
        NodeIndex::new(id.0 as usize)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn node_id_to_node_index_roundtrip() {
        let idx = NodeIndex::<u32>::new(42);
        let node_id = NodeId::from(idx);
        assert_eq!(node_id.0, 42);

        let back: NodeIndex<u32> = node_id.into();
        assert_eq!(back.index(), 42);
    }

    #[test]
    fn port_zero_reuses_primitive_id() {
        let id = PrimitiveId::new("rnn");
        assert_eq!(id.port(0), id);
        assert_eq!(id.port(2).as_str(), "rnn:2");
    }

    #[test]
    fn suffix_is_colon_separated() {
        let id = PrimitiveId::new("h");
        assert_eq!(id.with_suffix("convert_f32").as_str(), "h:convert_f32");
    }

    #[test]
    fn lookup_by_str_through_borrow() {
        let mut map = HashMap::new();
        map.insert(PrimitiveId::new("x"), 3);
        assert_eq!(map.get("x"), Some(&3));
    }

    #[test]
    fn serde_is_transparent() {
        let id = PrimitiveId::new("body_out");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"body_out\"");
        let back: PrimitiveId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
