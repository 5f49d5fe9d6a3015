//! The primitive vocabulary.
//!
//! [`PrimitiveOp`] is the operation carried by one topology primitive.
//! Source primitives ([`PrimitiveOp::InputLayout`], [`PrimitiveOp::Data`],
//! [`PrimitiveOp::MutableData`]) own memory and never run a kernel. Compute
//! primitives are executed by a kernel chosen at compile time. The two loop
//! primitives carry a nested body topology:
//!
//! - [`PrimitiveOp::Iterate`] is the structured "iterate-and-combine" form
//!   with tagged input/output kinds, as produced by model importers.
//! - [`PrimitiveOp::Loop`] is the lowered form with explicit mapping
//!   descriptors that the runtime executes.

use serde::{Deserialize, Serialize};

use crate::id::PrimitiveId;
use crate::loop_desc::{IterateDesc, LoopDesc};
use crate::types::{DataType, Layout, TensorValues};

/// Binary elementwise operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EltwiseMode {
    Sum,
    Sub,
    Prod,
    Div,
    Max,
    Min,
}

/// Unary activation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationFunction {
    Relu,
    Sigmoid,
    Tanh,
    Negate,
    Abs,
}

/// Elementwise comparison producing a `Bool` tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Operation of a single topology primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimitiveOp {
    /// Externally supplied tensor. Its memory is usually rebound by the
    /// caller through `set_input_data`.
    InputLayout { layout: Layout },

    /// Constant tensor initialized from literal values.
    Data { layout: Layout, values: TensorValues },

    /// Tensor initialized from literal values that the runtime may
    /// overwrite (trip counts, iteration counters).
    MutableData {
        layout: Layout,
        #[serde(default)]
        values: TensorValues,
    },

    /// Binary elementwise arithmetic. A single-element operand broadcasts.
    Eltwise { mode: EltwiseMode },

    /// Unary elementwise activation.
    Activation { function: ActivationFunction },

    /// Elementwise data type conversion.
    Convert { data_type: DataType },

    /// Binary elementwise comparison.
    Compare { op: CompareOp },

    /// Structured iterate-and-combine node, lowered to [`PrimitiveOp::Loop`]
    /// at compile time.
    Iterate(Box<IterateDesc>),

    /// Recurrent sub-graph with explicit mapping descriptors.
    Loop(Box<LoopDesc>),
}

impl PrimitiveOp {
    /// Short name for diagnostics and kernel names.
    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveOp::InputLayout { .. } => "input_layout",
            PrimitiveOp::Data { .. } => "data",
            PrimitiveOp::MutableData { .. } => "mutable_data",
            PrimitiveOp::Eltwise { .. } => "eltwise",
            PrimitiveOp::Activation { .. } => "activation",
            PrimitiveOp::Convert { .. } => "convert",
            PrimitiveOp::Compare { .. } => "compare",
            PrimitiveOp::Iterate(_) => "iterate",
            PrimitiveOp::Loop(_) => "loop",
        }
    }

    /// Whether this primitive owns memory and never runs a kernel.
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            PrimitiveOp::InputLayout { .. }
                | PrimitiveOp::Data { .. }
                | PrimitiveOp::MutableData { .. }
        )
    }

    pub fn is_loop(&self) -> bool {
        matches!(self, PrimitiveOp::Iterate(_) | PrimitiveOp::Loop(_))
    }

    /// Number of data inputs the op requires, or `None` when variable.
    pub fn expected_inputs(&self) -> Option<usize> {
        match self {
            PrimitiveOp::InputLayout { .. }
            | PrimitiveOp::Data { .. }
            | PrimitiveOp::MutableData { .. } => Some(0),
            PrimitiveOp::Eltwise { .. } | PrimitiveOp::Compare { .. } => Some(2),
            PrimitiveOp::Activation { .. } | PrimitiveOp::Convert { .. } => Some(1),
            PrimitiveOp::Iterate(_) | PrimitiveOp::Loop(_) => None,
        }
    }

    /// Ids of every output port of a primitive named `own`, port 0 first.
    pub fn output_ids(&self, own: &PrimitiveId) -> Vec<PrimitiveId> {
        match self {
            PrimitiveOp::Iterate(desc) => desc.output_ids(own),
            PrimitiveOp::Loop(desc) => desc.output_ids(own),
            _ => vec![own.clone()],
        }
    }

    /// The layout a source primitive declares.
    pub fn source_layout(&self) -> Option<&Layout> {
        match self {
            PrimitiveOp::InputLayout { layout }
            | PrimitiveOp::Data { layout, .. }
            | PrimitiveOp::MutableData { layout, .. } => Some(layout),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ops_have_no_inputs() {
        let layout = Layout::scalar(DataType::I64);
        let op = PrimitiveOp::MutableData {
            layout: layout.clone(),
            values: TensorValues::Int(vec![0]),
        };
        assert!(op.is_source());
        assert_eq!(op.expected_inputs(), Some(0));
        assert_eq!(op.source_layout(), Some(&layout));
    }

    #[test]
    fn compute_op_arity() {
        assert_eq!(
            PrimitiveOp::Eltwise { mode: EltwiseMode::Sum }.expected_inputs(),
            Some(2)
        );
        assert_eq!(
            PrimitiveOp::Convert { data_type: DataType::F32 }.expected_inputs(),
            Some(1)
        );
    }

    #[test]
    fn single_output_ops_expose_own_id() {
        let op = PrimitiveOp::Activation {
            function: ActivationFunction::Relu,
        };
        let own = PrimitiveId::new("relu");
        assert_eq!(op.output_ids(&own), vec![own]);
    }

    #[test]
    fn serde_externally_tagged() {
        let op = PrimitiveOp::Eltwise { mode: EltwiseMode::Prod };
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"Eltwise":{"mode":"Prod"}}"#);
        let back: PrimitiveOp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn mutable_data_values_default_when_omitted() {
        let json = r#"{"MutableData":{"layout":{"data_type":"I64","shape":[1]}}}"#;
        let op: PrimitiveOp = serde_json::from_str(json).unwrap();
        match op {
            PrimitiveOp::MutableData { values, .. } => assert!(values.is_empty()),
            other => panic!("expected MutableData, got {:?}", other),
        }
    }
}
