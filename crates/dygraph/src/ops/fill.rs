//! Constant-filling kernels.

use crate::desc::{BlockId, OpDesc, ProgramDesc};
use crate::dispatch::ExecutionContext;
use crate::error::FrameworkError;
use crate::tensor::{DataType, DenseTensor};

fn shape_attr(op: &OpDesc) -> Result<Vec<usize>, FrameworkError> {
    op.attr_ints("shape")?
        .iter()
        .map(|&d| {
            usize::try_from(d).map_err(|_| FrameworkError::ShapeMismatch {
                name: format!("{}.shape", op.op_type),
                expected: "non-negative dims".to_string(),
                actual: d.to_string(),
            })
        })
        .collect()
}

/// `Out = full(shape, value)` with optional `dtype` (default f32).
pub(crate) fn fill_constant_kernel(ctx: &ExecutionContext<'_>) -> Result<(), FrameworkError> {
    let op = ctx.op();
    let dims = shape_attr(op)?;
    let value = op.attr_f32("value")?;
    let dtype = op.attr_dtype("dtype").unwrap_or(DataType::F32);
    let tensor = DenseTensor::full(&dims, dtype, f64::from(value)).with_place(ctx.place());
    ctx.set_output("Out", tensor)
}

pub(crate) fn infer_fill_constant(
    op: &OpDesc,
    program: &mut ProgramDesc,
    block: BlockId,
) -> Result<(), FrameworkError> {
    let dims = shape_attr(op)?;
    let dtype = op.attr_dtype("dtype").unwrap_or(DataType::F32);
    for out in op.output("Out") {
        let desc = program.find_recursive_or_create_var(block, out)?;
        desc.dims = dims.iter().copied().collect();
        desc.dtype = dtype;
    }
    Ok(())
}

/// `Out = zeros_like(X)`.
pub(crate) fn fill_zeros_like_kernel(ctx: &ExecutionContext<'_>) -> Result<(), FrameworkError> {
    let x = ctx.input_tensor("X")?;
    ctx.set_output("Out", DenseTensor::zeros_like(&x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::Attribute;

    #[test]
    fn test_negative_shape_rejected() {
        let op = OpDesc::new("fill_constant").with_attr("shape", Attribute::Ints(vec![2, -1]));
        assert!(matches!(
            shape_attr(&op),
            Err(FrameworkError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_infer_fill_constant() {
        let mut program = ProgramDesc::new();
        let block = program.global_block();
        let op = OpDesc::new("fill_constant")
            .with_output("Out", ["cond"])
            .with_attr("shape", Attribute::Ints(vec![1]))
            .with_attr("value", Attribute::Float(1.0))
            .with_attr("dtype", Attribute::DataType(DataType::Bool));
        infer_fill_constant(&op, &mut program, block).unwrap();

        let desc = program.find_var_recursive(block, "cond").unwrap();
        assert_eq!(desc.dims.as_slice(), &[1]);
        assert_eq!(desc.dtype, DataType::Bool);
    }
}
