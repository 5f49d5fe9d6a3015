//! Per-op layout inference rules.
//!
//! [`infer_output_layout`] computes the output layout of a non-loop
//! primitive from its input layouts:
//!
//! | op | rule |
//! |----|------|
//! | InputLayout / MutableData | declared layout |
//! | Data | declared layout, value count must match |
//! | Eltwise | same type; equal shapes, or one operand of one element |
//! | Compare | as Eltwise, result type Bool |
//! | Activation | input layout |
//! | Convert | input shape, target type |
//!
//! Loop primitives have no rule here: their outputs depend on the compiled
//! body and are computed by the program compiler.

use loopnet_core::id::PrimitiveId;
use loopnet_core::ops::PrimitiveOp;
use loopnet_core::types::{DataType, Layout};

use super::conversion::wider_type;
use super::diagnostics::{FixSuggestion, LayoutError};

/// Infers the output layout of `op` named `primitive` given its input
/// layouts in port order.
pub fn infer_output_layout(
    primitive: &PrimitiveId,
    op: &PrimitiveOp,
    inputs: &[Layout],
) -> Result<Layout, LayoutError> {
    if let Some(expected) = op.expected_inputs() {
        if inputs.len() != expected {
            return Err(LayoutError::WrongInputCount {
                primitive: primitive.clone(),
                expected,
                actual: inputs.len(),
            });
        }
    }

    match op {
        PrimitiveOp::InputLayout { layout } => Ok(layout.clone()),
        PrimitiveOp::Data { layout, values } => {
            check_value_count(primitive, layout, values.len())?;
            Ok(layout.clone())
        }
        PrimitiveOp::MutableData { layout, values } => {
            if !values.is_empty() {
                check_value_count(primitive, layout, values.len())?;
            }
            Ok(layout.clone())
        }
        PrimitiveOp::Eltwise { .. } => binary_layout(primitive, &inputs[0], &inputs[1]),
        PrimitiveOp::Compare { .. } => {
            binary_layout(primitive, &inputs[0], &inputs[1]).map(|l| l.with_data_type(DataType::Bool))
        }
        PrimitiveOp::Activation { .. } => Ok(inputs[0].clone()),
        PrimitiveOp::Convert { data_type } => Ok(inputs[0].with_data_type(*data_type)),
        PrimitiveOp::Iterate(_) | PrimitiveOp::Loop(_) => Err(LayoutError::NoLayoutRule {
            primitive: primitive.clone(),
            op: op.name().to_string(),
        }),
    }
}

fn check_value_count(primitive: &PrimitiveId, layout: &Layout, actual: usize) -> Result<(), LayoutError> {
    let expected = layout.linear_size();
    if expected != actual {
        return Err(LayoutError::ValueCountMismatch {
            primitive: primitive.clone(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn binary_layout(primitive: &PrimitiveId, lhs: &Layout, rhs: &Layout) -> Result<Layout, LayoutError> {
    if lhs.data_type != rhs.data_type {
        let suggestion = wider_type(lhs.data_type, rhs.data_type)
            .filter(|wide| *wide == lhs.data_type)
            .map(|to| FixSuggestion::InsertConvert {
                from: rhs.data_type,
                to,
            });
        return Err(LayoutError::TypeMismatch {
            primitive: primitive.clone(),
            port: 1,
            expected: lhs.data_type,
            actual: rhs.data_type,
            suggestion,
        });
    }

    if lhs.shape == rhs.shape || rhs.linear_size() == 1 {
        Ok(lhs.clone())
    } else if lhs.linear_size() == 1 {
        Ok(rhs.clone())
    } else {
        Err(LayoutError::ShapeMismatch {
            primitive: primitive.clone(),
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        })
    }
}

/// Checks that a trip count, execution condition or iteration counter is a
/// single integer or boolean element.
pub fn check_control_scalar(primitive: &PrimitiveId, layout: &Layout) -> Result<(), LayoutError> {
    if layout.linear_size() != 1 || layout.data_type.is_float() {
        return Err(LayoutError::InvalidControlScalar {
            primitive: primitive.clone(),
            layout: layout.clone(),
        });
    }
    Ok(())
}

/// Checks that `axis` exists in `layout`.
pub fn check_axis(primitive: &PrimitiveId, axis: usize, layout: &Layout) -> Result<(), LayoutError> {
    if axis >= layout.rank() {
        return Err(LayoutError::InvalidAxis {
            primitive: primitive.clone(),
            axis,
            layout: layout.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use loopnet_core::ops::{ActivationFunction, CompareOp, EltwiseMode};
    use loopnet_core::types::TensorValues;
    use proptest::prelude::*;

    use super::*;

    fn id(name: &str) -> PrimitiveId {
        PrimitiveId::new(name)
    }

    #[test]
    fn eltwise_same_shape() {
        let a = Layout::new(DataType::F32, &[2, 3]);
        let out = infer_output_layout(
            &id("add"),
            &PrimitiveOp::Eltwise { mode: EltwiseMode::Sum },
            &[a.clone(), a.clone()],
        )
        .unwrap();
        assert_eq!(out, a);
    }

    #[test]
    fn eltwise_broadcasts_single_element() {
        let a = Layout::new(DataType::I64, &[4]);
        let one = Layout::scalar(DataType::I64);
        let op = PrimitiveOp::Eltwise { mode: EltwiseMode::Prod };
        assert_eq!(
            infer_output_layout(&id("m"), &op, &[a.clone(), one.clone()]).unwrap(),
            a
        );
        assert_eq!(infer_output_layout(&id("m"), &op, &[one, a.clone()]).unwrap(), a);
    }

    #[test]
    fn eltwise_type_mismatch_suggests_convert() {
        let err = infer_output_layout(
            &id("add"),
            &PrimitiveOp::Eltwise { mode: EltwiseMode::Sum },
            &[Layout::scalar(DataType::I64), Layout::scalar(DataType::I32)],
        )
        .unwrap_err();
        match err {
            LayoutError::TypeMismatch { suggestion, .. } => assert_eq!(
                suggestion,
                Some(FixSuggestion::InsertConvert {
                    from: DataType::I32,
                    to: DataType::I64
                })
            ),
            other => panic!("expected TypeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn eltwise_shape_mismatch() {
        let err = infer_output_layout(
            &id("add"),
            &PrimitiveOp::Eltwise { mode: EltwiseMode::Sum },
            &[
                Layout::new(DataType::F32, &[2]),
                Layout::new(DataType::F32, &[3]),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::ShapeMismatch { .. }));
    }

    #[test]
    fn compare_produces_bool() {
        let out = infer_output_layout(
            &id("lt"),
            &PrimitiveOp::Compare { op: CompareOp::Lt },
            &[Layout::scalar(DataType::I64), Layout::scalar(DataType::I64)],
        )
        .unwrap();
        assert_eq!(out, Layout::scalar(DataType::Bool));
    }

    #[test]
    fn convert_keeps_shape() {
        let out = infer_output_layout(
            &id("c"),
            &PrimitiveOp::Convert { data_type: DataType::I32 },
            &[Layout::new(DataType::F32, &[2, 2])],
        )
        .unwrap();
        assert_eq!(out, Layout::new(DataType::I32, &[2, 2]));
    }

    #[test]
    fn wrong_input_count() {
        let err = infer_output_layout(
            &id("relu"),
            &PrimitiveOp::Activation {
                function: ActivationFunction::Relu,
            },
            &[],
        )
        .unwrap_err();
        assert_eq!(
            err,
            LayoutError::WrongInputCount {
                primitive: id("relu"),
                expected: 1,
                actual: 0
            }
        );
    }

    #[test]
    fn data_value_count_checked() {
        let op = PrimitiveOp::Data {
            layout: Layout::new(DataType::F32, &[3]),
            values: TensorValues::Float(vec![1.0]),
        };
        assert!(matches!(
            infer_output_layout(&id("d"), &op, &[]),
            Err(LayoutError::ValueCountMismatch { .. })
        ));
    }

    #[test]
    fn control_scalar_rules() {
        assert!(check_control_scalar(&id("t"), &Layout::scalar(DataType::I64)).is_ok());
        assert!(check_control_scalar(&id("t"), &Layout::new(DataType::Bool, &[])).is_ok());
        assert!(check_control_scalar(&id("t"), &Layout::scalar(DataType::F32)).is_err());
        assert!(check_control_scalar(&id("t"), &Layout::new(DataType::I32, &[2])).is_err());
    }

    #[test]
    fn axis_rules() {
        let layout = Layout::new(DataType::F32, &[2, 1, 4]);
        assert!(check_axis(&id("x"), 2, &layout).is_ok());
        assert!(check_axis(&id("x"), 3, &layout).is_err());
    }

    proptest! {
        #[test]
        fn activation_preserves_any_layout(dims in proptest::collection::vec(1usize..5, 0..4)) {
            let layout = Layout::new(DataType::F32, &dims);
            let out = infer_output_layout(
                &id("tanh"),
                &PrimitiveOp::Activation { function: ActivationFunction::Tanh },
                std::slice::from_ref(&layout),
            ).unwrap();
            prop_assert_eq!(out, layout);
        }
    }
}
