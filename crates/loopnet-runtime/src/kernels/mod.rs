//! Kernel selection.
//!
//! The program compiler asks an [`ImplementationSelector`] for one
//! [`Kernel`] per compute primitive. The loop engine never looks inside a
//! kernel: it only hands it input and output views through the network.
//!
//! [`ReferenceSelector`] provides host implementations of every compute op:
//!
//! | op | supported element types |
//! |----|-------------------------|
//! | Eltwise | integers and floats |
//! | Activation Relu / Negate / Abs | integers and floats |
//! | Activation Sigmoid / Tanh | floats |
//! | Convert | all |
//! | Compare | all |

pub mod reference;

use std::fmt;
use std::sync::Arc;

use loopnet_core::graph::ProgramNode;
use loopnet_core::memory::MemoryView;
use loopnet_core::ops::{ActivationFunction, PrimitiveOp};
use loopnet_core::types::{DataType, Layout};

use crate::error::{ExecutionError, KernelError};

pub use reference::{ActivationKernel, CompareKernel, ConvertKernel, EltwiseKernel};

/// A compiled computation for one primitive.
pub trait Kernel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Reads `inputs` (in port order) and writes `output`.
    fn execute(&self, inputs: &[MemoryView], output: &MemoryView) -> Result<(), ExecutionError>;
}

/// Chooses a kernel for a compute primitive given its resolved layouts.
pub trait ImplementationSelector: Send + Sync {
    fn choose_implementation(
        &self,
        node: &ProgramNode,
        inputs: &[Layout],
        output: &Layout,
    ) -> Result<Arc<dyn Kernel>, KernelError>;
}

/// Host kernels for the compute ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceSelector;

impl ImplementationSelector for ReferenceSelector {
    fn choose_implementation(
        &self,
        node: &ProgramNode,
        inputs: &[Layout],
        output: &Layout,
    ) -> Result<Arc<dyn Kernel>, KernelError> {
        let unsupported = |data_type: DataType| KernelError::NoImplementationFound {
            primitive: node.id.clone(),
            op: node.op.name().to_string(),
            data_type,
        };
        let input_type = inputs.first().map_or(output.data_type, |l| l.data_type);

        match &node.op {
            PrimitiveOp::Eltwise { mode } => {
                if input_type.is_bool() {
                    return Err(unsupported(input_type));
                }
                Ok(Arc::new(EltwiseKernel::new(node.id.clone(), *mode)))
            }
            PrimitiveOp::Activation { function } => {
                let float_only = matches!(
                    function,
                    ActivationFunction::Sigmoid | ActivationFunction::Tanh
                );
                if input_type.is_bool() || (float_only && !input_type.is_float()) {
                    return Err(unsupported(input_type));
                }
                Ok(Arc::new(ActivationKernel::new(node.id.clone(), *function)))
            }
            PrimitiveOp::Convert { data_type } => {
                Ok(Arc::new(ConvertKernel::new(node.id.clone(), *data_type)))
            }
            PrimitiveOp::Compare { op } => Ok(Arc::new(CompareKernel::new(node.id.clone(), *op))),
            _ => Err(unsupported(output.data_type)),
        }
    }
}

#[cfg(test)]
mod tests {
    use loopnet_core::id::PrimitiveId;
    use loopnet_core::ops::{CompareOp, EltwiseMode};

    use super::*;

    fn node(op: PrimitiveOp) -> ProgramNode {
        ProgramNode {
            id: PrimitiveId::new("n"),
            inputs: Vec::new(),
            outputs: vec![PrimitiveId::new("n")],
            op,
        }
    }

    #[test]
    fn selects_eltwise_for_numbers() {
        let layout = Layout::new(DataType::I32, &[3]);
        let kernel = ReferenceSelector
            .choose_implementation(
                &node(PrimitiveOp::Eltwise { mode: EltwiseMode::Sum }),
                &[layout.clone(), layout.clone()],
                &layout,
            )
            .unwrap();
        assert_eq!(kernel.name(), "eltwise_sum");
    }

    #[test]
    fn rejects_bool_eltwise() {
        let layout = Layout::scalar(DataType::Bool);
        let err = ReferenceSelector
            .choose_implementation(
                &node(PrimitiveOp::Eltwise { mode: EltwiseMode::Max }),
                &[layout.clone(), layout.clone()],
                &layout,
            )
            .unwrap_err();
        assert_eq!(
            err,
            KernelError::NoImplementationFound {
                primitive: PrimitiveId::new("n"),
                op: "eltwise".to_string(),
                data_type: DataType::Bool,
            }
        );
    }

    #[test]
    fn tanh_needs_floats() {
        let int = Layout::scalar(DataType::I64);
        let op = PrimitiveOp::Activation {
            function: ActivationFunction::Tanh,
        };
        assert!(ReferenceSelector
            .choose_implementation(&node(op.clone()), &[int.clone()], &int)
            .is_err());

        let float = Layout::scalar(DataType::F32);
        assert!(ReferenceSelector
            .choose_implementation(&node(op), &[float.clone()], &float)
            .is_ok());
    }

    #[test]
    fn compare_accepts_bool() {
        let layout = Layout::scalar(DataType::Bool);
        assert!(ReferenceSelector
            .choose_implementation(
                &node(PrimitiveOp::Compare { op: CompareOp::Eq }),
                &[layout.clone(), layout.clone()],
                &layout,
            )
            .is_ok());
    }
}
