//! Host reference kernels.
//!
//! Kernels decode their inputs to [`Scalar`]s, compute in `i64` (wrapping)
//! or `f64`, and encode into the output type. A single-element operand
//! broadcasts against the other one. Inputs shorter than the compiled
//! output fill a prefix of it.

use loopnet_core::id::PrimitiveId;
use loopnet_core::memory::MemoryView;
use loopnet_core::ops::{ActivationFunction, CompareOp, EltwiseMode};
use loopnet_core::types::{DataType, Scalar};

use super::Kernel;
use crate::error::ExecutionError;

fn failure(primitive: &PrimitiveId, message: impl Into<String>) -> ExecutionError {
    ExecutionError::Kernel {
        primitive: primitive.clone(),
        message: message.into(),
    }
}

fn operands<'a>(
    primitive: &PrimitiveId,
    inputs: &'a [MemoryView],
    expected: usize,
) -> Result<&'a [MemoryView], ExecutionError> {
    if inputs.len() != expected {
        return Err(failure(
            primitive,
            format!("expected {} inputs, got {}", expected, inputs.len()),
        ));
    }
    Ok(inputs)
}

/// Element count of a broadcast binary op, checked against the output.
fn broadcast_len(
    primitive: &PrimitiveId,
    lhs: usize,
    rhs: usize,
    output: &MemoryView,
) -> Result<usize, ExecutionError> {
    let len = if lhs == rhs || rhs == 1 {
        lhs
    } else if lhs == 1 {
        rhs
    } else {
        return Err(failure(
            primitive,
            format!("operands of {} and {} elements do not broadcast", lhs, rhs),
        ));
    };
    check_fits(primitive, len, output)?;
    Ok(len)
}

fn check_fits(primitive: &PrimitiveId, len: usize, output: &MemoryView) -> Result<(), ExecutionError> {
    let capacity = output.layout().linear_size();
    if len > capacity {
        return Err(failure(
            primitive,
            format!("{} results do not fit output {}", len, output.layout()),
        ));
    }
    Ok(())
}

fn pick(values: &[Scalar], index: usize) -> Scalar {
    if values.len() == 1 {
        values[0]
    } else {
        values[index]
    }
}

fn store(output: &MemoryView, values: &[Scalar]) {
    let data_type = output.layout().data_type;
    let size = data_type.size_in_bytes();
    output.write(|bytes| {
        for (chunk, value) in bytes.chunks_exact_mut(size).zip(values) {
            data_type.encode(*value, chunk);
        }
    });
}

// ---------------------------------------------------------------------------
// Eltwise
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct EltwiseKernel {
    primitive: PrimitiveId,
    mode: EltwiseMode,
    name: String,
}

impl EltwiseKernel {
    pub fn new(primitive: PrimitiveId, mode: EltwiseMode) -> Self {
        let name = format!("eltwise_{}", format!("{:?}", mode).to_lowercase());
        EltwiseKernel {
            primitive,
            mode,
            name,
        }
    }

    fn apply_int(&self, lhs: i64, rhs: i64) -> Result<i64, ExecutionError> {
        Ok(match self.mode {
            EltwiseMode::Sum => lhs.wrapping_add(rhs),
            EltwiseMode::Sub => lhs.wrapping_sub(rhs),
            EltwiseMode::Prod => lhs.wrapping_mul(rhs),
            EltwiseMode::Div => {
                if rhs == 0 {
                    return Err(failure(&self.primitive, "integer division by zero"));
                }
                lhs.wrapping_div(rhs)
            }
            EltwiseMode::Max => lhs.max(rhs),
            EltwiseMode::Min => lhs.min(rhs),
        })
    }

    fn apply_float(&self, lhs: f64, rhs: f64) -> f64 {
        match self.mode {
            EltwiseMode::Sum => lhs + rhs,
            EltwiseMode::Sub => lhs - rhs,
            EltwiseMode::Prod => lhs * rhs,
            EltwiseMode::Div => lhs / rhs,
            EltwiseMode::Max => lhs.max(rhs),
            EltwiseMode::Min => lhs.min(rhs),
        }
    }
}

impl Kernel for EltwiseKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, inputs: &[MemoryView], output: &MemoryView) -> Result<(), ExecutionError> {
        let inputs = operands(&self.primitive, inputs, 2)?;
        let lhs = inputs[0].to_scalars();
        let rhs = inputs[1].to_scalars();
        let len = broadcast_len(&self.primitive, lhs.len(), rhs.len(), output)?;
        let float = output.layout().data_type.is_float();

        let mut values = Vec::with_capacity(len);
        for i in 0..len {
            let (a, b) = (pick(&lhs, i), pick(&rhs, i));
            values.push(if float {
                Scalar::Float(self.apply_float(a.as_f64(), b.as_f64()))
            } else {
                Scalar::Int(self.apply_int(a.as_i64(), b.as_i64())?)
            });
        }
        store(output, &values);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ActivationKernel {
    primitive: PrimitiveId,
    function: ActivationFunction,
    name: String,
}

impl ActivationKernel {
    pub fn new(primitive: PrimitiveId, function: ActivationFunction) -> Self {
        let name = format!("activation_{}", format!("{:?}", function).to_lowercase());
        ActivationKernel {
            primitive,
            function,
            name,
        }
    }

    fn apply(&self, value: Scalar, float: bool) -> Scalar {
        if float {
            let x = value.as_f64();
            Scalar::Float(match self.function {
                ActivationFunction::Relu => x.max(0.0),
                ActivationFunction::Sigmoid => 1.0 / (1.0 + (-x).exp()),
                ActivationFunction::Tanh => x.tanh(),
                ActivationFunction::Negate => -x,
                ActivationFunction::Abs => x.abs(),
            })
        } else {
            let x = value.as_i64();
            Scalar::Int(match self.function {
                ActivationFunction::Relu => x.max(0),
                ActivationFunction::Negate => x.wrapping_neg(),
                ActivationFunction::Abs => x.wrapping_abs(),
                // Rejected at selection time for integer types.
                ActivationFunction::Sigmoid | ActivationFunction::Tanh => x,
            })
        }
    }
}

impl Kernel for ActivationKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, inputs: &[MemoryView], output: &MemoryView) -> Result<(), ExecutionError> {
        let inputs = operands(&self.primitive, inputs, 1)?;
        let source = inputs[0].to_scalars();
        check_fits(&self.primitive, source.len(), output)?;
        let float = output.layout().data_type.is_float();
        let values: Vec<Scalar> = source.into_iter().map(|v| self.apply(v, float)).collect();
        store(output, &values);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Convert
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ConvertKernel {
    primitive: PrimitiveId,
    name: String,
}

impl ConvertKernel {
    pub fn new(primitive: PrimitiveId, data_type: DataType) -> Self {
        ConvertKernel {
            primitive,
            name: format!("convert_{}", data_type.name()),
        }
    }
}

impl Kernel for ConvertKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, inputs: &[MemoryView], output: &MemoryView) -> Result<(), ExecutionError> {
        let inputs = operands(&self.primitive, inputs, 1)?;
        let values = inputs[0].to_scalars();
        check_fits(&self.primitive, values.len(), output)?;
        store(output, &values);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Compare
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct CompareKernel {
    primitive: PrimitiveId,
    op: CompareOp,
    name: String,
}

impl CompareKernel {
    pub fn new(primitive: PrimitiveId, op: CompareOp) -> Self {
        let name = format!("compare_{}", format!("{:?}", op).to_lowercase());
        CompareKernel { primitive, op, name }
    }

    fn holds<T: PartialOrd>(&self, lhs: T, rhs: T) -> bool {
        match self.op {
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Gt => lhs > rhs,
            CompareOp::Ge => lhs >= rhs,
        }
    }
}

impl Kernel for CompareKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, inputs: &[MemoryView], output: &MemoryView) -> Result<(), ExecutionError> {
        let inputs = operands(&self.primitive, inputs, 2)?;
        let lhs = inputs[0].to_scalars();
        let rhs = inputs[1].to_scalars();
        let len = broadcast_len(&self.primitive, lhs.len(), rhs.len(), output)?;
        let float = inputs[0].layout().data_type.is_float() || inputs[1].layout().data_type.is_float();

        let values: Vec<Scalar> = (0..len)
            .map(|i| {
                let (a, b) = (pick(&lhs, i), pick(&rhs, i));
                let result = if float {
                    self.holds(a.as_f64(), b.as_f64())
                } else {
                    self.holds(a.as_i64(), b.as_i64())
                };
                Scalar::Bool(result)
            })
            .collect();
        store(output, &values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use loopnet_core::types::{Layout, TensorValues};

    use super::*;

    fn id() -> PrimitiveId {
        PrimitiveId::new("k")
    }

    fn view(data_type: DataType, values: TensorValues) -> MemoryView {
        let view = MemoryView::allocate(Layout::new(data_type, &[values.len()]));
        view.fill(&values).unwrap();
        view
    }

    #[test]
    fn eltwise_sum_with_broadcast() {
        let a = view(DataType::I64, TensorValues::Int(vec![1, 2, 3]));
        let b = view(DataType::I64, TensorValues::Int(vec![10]));
        let out = MemoryView::allocate(Layout::new(DataType::I64, &[3]));
        EltwiseKernel::new(id(), EltwiseMode::Sum)
            .execute(&[a, b], &out)
            .unwrap();
        assert_eq!(out.to_i64_vec(), vec![11, 12, 13]);
    }

    #[test]
    fn eltwise_float_prod() {
        let a = view(DataType::F32, TensorValues::Float(vec![1.5, 2.0]));
        let b = view(DataType::F32, TensorValues::Float(vec![2.0, 0.5]));
        let out = MemoryView::allocate(Layout::new(DataType::F32, &[2]));
        EltwiseKernel::new(id(), EltwiseMode::Prod)
            .execute(&[a, b], &out)
            .unwrap();
        assert_eq!(out.to_f64_vec(), vec![3.0, 1.0]);
    }

    #[test]
    fn integer_division_by_zero_fails() {
        let a = view(DataType::I32, TensorValues::Int(vec![4]));
        let b = view(DataType::I32, TensorValues::Int(vec![0]));
        let out = MemoryView::allocate(Layout::scalar(DataType::I32));
        let err = EltwiseKernel::new(id(), EltwiseMode::Div)
            .execute(&[a, b], &out)
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Kernel { .. }));
    }

    #[test]
    fn mismatched_operands_fail() {
        let a = view(DataType::I64, TensorValues::Int(vec![1, 2]));
        let b = view(DataType::I64, TensorValues::Int(vec![1, 2, 3]));
        let out = MemoryView::allocate(Layout::new(DataType::I64, &[3]));
        assert!(EltwiseKernel::new(id(), EltwiseMode::Sum)
            .execute(&[a, b], &out)
            .is_err());
    }

    #[test]
    fn activation_relu_and_negate() {
        let a = view(DataType::I32, TensorValues::Int(vec![-2, 3]));
        let out = MemoryView::allocate(Layout::new(DataType::I32, &[2]));
        ActivationKernel::new(id(), ActivationFunction::Relu)
            .execute(std::slice::from_ref(&a), &out)
            .unwrap();
        assert_eq!(out.to_i64_vec(), vec![0, 3]);

        ActivationKernel::new(id(), ActivationFunction::Negate)
            .execute(&[a], &out)
            .unwrap();
        assert_eq!(out.to_i64_vec(), vec![2, -3]);
    }

    #[test]
    fn convert_float_to_int_truncates() {
        let a = view(DataType::F32, TensorValues::Float(vec![1.75, -2.5]));
        let out = MemoryView::allocate(Layout::new(DataType::I64, &[2]));
        let kernel = ConvertKernel::new(id(), DataType::I64);
        assert_eq!(kernel.name(), "convert_i64");
        kernel.execute(&[a], &out).unwrap();
        assert_eq!(out.to_i64_vec(), vec![1, -2]);
    }

    #[test]
    fn compare_produces_bools() {
        let a = view(DataType::I64, TensorValues::Int(vec![1, 5]));
        let b = view(DataType::I64, TensorValues::Int(vec![3]));
        let out = MemoryView::allocate(Layout::new(DataType::Bool, &[2]));
        CompareKernel::new(id(), CompareOp::Lt)
            .execute(&[a, b], &out)
            .unwrap();
        assert_eq!(out.to_i64_vec(), vec![1, 0]);
    }
}
