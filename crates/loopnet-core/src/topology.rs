//! Topology: the serialized, user-facing form of a graph.
//!
//! A [`Topology`] is an insertion-ordered set of [`Primitive`]s keyed by
//! [`PrimitiveId`]. Each primitive names the ids it reads in `inputs`; the
//! order of that list is the input port order. Nothing here checks that
//! inputs exist or that the graph is acyclic -- that happens when a
//! [`ProgramGraph`](crate::graph::ProgramGraph) is built from it.
//!
//! On the wire a topology is `{ "primitives": [ ... ] }`; duplicate ids are
//! rejected while deserializing.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::PrimitiveId;
use crate::ops::{ActivationFunction, CompareOp, EltwiseMode, PrimitiveOp};
use crate::types::{DataType, Layout, TensorValues};

/// One node of a topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Primitive {
    pub id: PrimitiveId,
    #[serde(default)]
    pub inputs: Vec<PrimitiveId>,
    pub op: PrimitiveOp,
}

impl Primitive {
    pub fn new(id: impl Into<PrimitiveId>, inputs: Vec<PrimitiveId>, op: PrimitiveOp) -> Self {
        Primitive {
            id: id.into(),
            inputs,
            op,
        }
    }

    pub fn input_layout(id: impl Into<PrimitiveId>, layout: Layout) -> Self {
        Primitive::new(id, Vec::new(), PrimitiveOp::InputLayout { layout })
    }

    pub fn data(id: impl Into<PrimitiveId>, layout: Layout, values: TensorValues) -> Self {
        Primitive::new(id, Vec::new(), PrimitiveOp::Data { layout, values })
    }

    pub fn mutable_data(id: impl Into<PrimitiveId>, layout: Layout, values: TensorValues) -> Self {
        Primitive::new(id, Vec::new(), PrimitiveOp::MutableData { layout, values })
    }

    pub fn eltwise(
        id: impl Into<PrimitiveId>,
        lhs: impl Into<PrimitiveId>,
        rhs: impl Into<PrimitiveId>,
        mode: EltwiseMode,
    ) -> Self {
        Primitive::new(
            id,
            vec![lhs.into(), rhs.into()],
            PrimitiveOp::Eltwise { mode },
        )
    }

    pub fn activation(
        id: impl Into<PrimitiveId>,
        input: impl Into<PrimitiveId>,
        function: ActivationFunction,
    ) -> Self {
        Primitive::new(id, vec![input.into()], PrimitiveOp::Activation { function })
    }

    pub fn convert(
        id: impl Into<PrimitiveId>,
        input: impl Into<PrimitiveId>,
        data_type: DataType,
    ) -> Self {
        Primitive::new(id, vec![input.into()], PrimitiveOp::Convert { data_type })
    }

    pub fn compare(
        id: impl Into<PrimitiveId>,
        lhs: impl Into<PrimitiveId>,
        rhs: impl Into<PrimitiveId>,
        op: CompareOp,
    ) -> Self {
        Primitive::new(id, vec![lhs.into(), rhs.into()], PrimitiveOp::Compare { op })
    }
}

/// Insertion-ordered set of primitives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TopologyRepr", into = "TopologyRepr")]
pub struct Topology {
    primitives: IndexMap<PrimitiveId, Primitive>,
}

#[derive(Serialize, Deserialize)]
struct TopologyRepr {
    primitives: Vec<Primitive>,
}

impl TryFrom<TopologyRepr> for Topology {
    type Error = CoreError;

    fn try_from(repr: TopologyRepr) -> Result<Self, Self::Error> {
        let mut topology = Topology::new();
        for primitive in repr.primitives {
            topology.add(primitive)?;
        }
        Ok(topology)
    }
}

impl From<Topology> for TopologyRepr {
    fn from(topology: Topology) -> Self {
        TopologyRepr {
            primitives: topology.primitives.into_values().collect(),
        }
    }
}

impl Topology {
    pub fn new() -> Self {
        Topology::default()
    }

    /// Adds a primitive. Fails if its id is already taken.
    pub fn add(&mut self, primitive: Primitive) -> Result<(), CoreError> {
        if self.primitives.contains_key(&primitive.id) {
            return Err(CoreError::DuplicatePrimitive { id: primitive.id });
        }
        self.primitives.insert(primitive.id.clone(), primitive);
        Ok(())
    }

    /// Builder-style [`add`](Self::add).
    pub fn with(mut self, primitive: Primitive) -> Result<Self, CoreError> {
        self.add(primitive)?;
        Ok(self)
    }

    /// Replaces the primitive with the same id, keeping its position.
    pub fn replace(&mut self, primitive: Primitive) -> Result<Primitive, CoreError> {
        match self.primitives.get_mut(&primitive.id) {
            Some(slot) => Ok(std::mem::replace(slot, primitive)),
            None => Err(CoreError::PrimitiveNotFound { id: primitive.id }),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Primitive> {
        self.primitives.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.primitives.contains_key(id)
    }

    /// Primitives in insertion order.
    pub fn primitives(&self) -> impl Iterator<Item = &Primitive> {
        self.primitives.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &PrimitiveId> {
        self.primitives.keys()
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Topology {
        Topology::new()
            .with(Primitive::input_layout(
                "x",
                Layout::new(DataType::F32, &[4]),
            ))
            .unwrap()
            .with(Primitive::data(
                "one",
                Layout::scalar(DataType::F32),
                TensorValues::Float(vec![1.0]),
            ))
            .unwrap()
            .with(Primitive::eltwise("y", "x", "one", EltwiseMode::Sum))
            .unwrap()
    }

    #[test]
    fn add_rejects_duplicate() {
        let mut topology = sample();
        let err = topology
            .add(Primitive::input_layout("x", Layout::scalar(DataType::I32)))
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::DuplicatePrimitive {
                id: PrimitiveId::new("x")
            }
        );
    }

    #[test]
    fn insertion_order_is_kept() {
        let topology = sample();
        let ids: Vec<&str> = topology.ids().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["x", "one", "y"]);
    }

    #[test]
    fn replace_keeps_position() {
        let mut topology = sample();
        let old = topology
            .replace(Primitive::activation("one", "x", ActivationFunction::Relu))
            .unwrap();
        assert!(old.op.is_source());
        let ids: Vec<&str> = topology.ids().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["x", "one", "y"]);
        assert!(topology
            .replace(Primitive::input_layout("zz", Layout::scalar(DataType::I32)))
            .is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let topology = sample();
        let json = serde_json::to_string(&topology).unwrap();
        assert!(json.starts_with(r#"{"primitives":[{"id":"x""#));
        let back: Topology = serde_json::from_str(&json).unwrap();
        assert_eq!(back, topology);
    }

    #[test]
    fn deserialize_rejects_duplicates() {
        let json = r#"{"primitives":[
            {"id":"a","op":{"InputLayout":{"layout":{"data_type":"F32","shape":[1]}}}},
            {"id":"a","op":{"InputLayout":{"layout":{"data_type":"F32","shape":[1]}}}}
        ]}"#;
        assert!(serde_json::from_str::<Topology>(json).is_err());
    }
}
