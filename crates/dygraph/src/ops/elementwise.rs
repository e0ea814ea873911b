//! Element-wise arithmetic kernels and their gradients.
//!
//! Operands of binary ops must have identical dims; broadcasting is not
//! supported.

use crate::desc::{Attribute, BlockId, OpDesc, ProgramDesc};
use crate::dispatch::ExecutionContext;
use crate::error::FrameworkError;
use crate::registry::GradOpMakerContext;

/// Copy dims and dtype of input `X` onto every `Out` descriptor when known.
pub(crate) fn infer_same_as_x(
    op: &OpDesc,
    program: &mut ProgramDesc,
    block: BlockId,
) -> Result<(), FrameworkError> {
    let Some(x) = op.input("X").first() else {
        return Ok(());
    };
    let Some(x_desc) = program.find_var_recursive(block, x).cloned() else {
        return Ok(());
    };
    for out in op.output("Out") {
        let out_desc = program.find_recursive_or_create_var(block, out)?;
        out_desc.dims = x_desc.dims.clone();
        out_desc.dtype = x_desc.dtype;
    }
    Ok(())
}

fn set_if_bound(
    ctx: &ExecutionContext<'_>,
    slot: &str,
    tensor: crate::tensor::DenseTensor,
) -> Result<(), FrameworkError> {
    if ctx.output_count(slot) > 0 {
        ctx.set_output(slot, tensor)?;
    }
    Ok(())
}

pub(crate) fn add_kernel(ctx: &ExecutionContext<'_>) -> Result<(), FrameworkError> {
    let x = ctx.input_tensor("X")?;
    let y = ctx.input_tensor("Y")?;
    ctx.set_output("Out", x.add(&y)?)
}

pub(crate) fn add_grad_maker(
    ctx: &mut GradOpMakerContext<'_>,
) -> Result<Vec<OpDesc>, FrameworkError> {
    let out_grad = ctx.output_grad("Out");
    let x_grad = ctx.input_grad("X", false);
    let y_grad = ctx.input_grad("Y", false);
    Ok(vec![
        OpDesc::new("elementwise_add_grad")
            .with_input("Out@GRAD", out_grad)
            .with_output("X@GRAD", x_grad)
            .with_output("Y@GRAD", y_grad),
    ])
}

pub(crate) fn add_grad_kernel(ctx: &ExecutionContext<'_>) -> Result<(), FrameworkError> {
    let dout = ctx.input_tensor("Out@GRAD")?;
    set_if_bound(ctx, "X@GRAD", dout.clone())?;
    set_if_bound(ctx, "Y@GRAD", dout)
}

pub(crate) fn mul_kernel(ctx: &ExecutionContext<'_>) -> Result<(), FrameworkError> {
    let x = ctx.input_tensor("X")?;
    let y = ctx.input_tensor("Y")?;
    ctx.set_output("Out", x.zip_map_f32(&y, |a, b| a * b)?)
}

pub(crate) fn mul_grad_maker(
    ctx: &mut GradOpMakerContext<'_>,
) -> Result<Vec<OpDesc>, FrameworkError> {
    let out_grad = ctx.output_grad("Out");
    let x_grad = ctx.input_grad("X", false);
    let y_grad = ctx.input_grad("Y", false);
    Ok(vec![
        OpDesc::new("elementwise_mul_grad")
            .with_input("X", ctx.input("X"))
            .with_input("Y", ctx.input("Y"))
            .with_input("Out@GRAD", out_grad)
            .with_output("X@GRAD", x_grad)
            .with_output("Y@GRAD", y_grad),
    ])
}

pub(crate) fn mul_grad_kernel(ctx: &ExecutionContext<'_>) -> Result<(), FrameworkError> {
    let x = ctx.input_tensor("X")?;
    let y = ctx.input_tensor("Y")?;
    let dout = ctx.input_tensor("Out@GRAD")?;
    set_if_bound(ctx, "X@GRAD", dout.zip_map_f32(&y, |g, b| g * b)?)?;
    set_if_bound(ctx, "Y@GRAD", dout.zip_map_f32(&x, |g, a| g * a)?)
}

/// `Out = X * scale + bias`.
pub(crate) fn scale_kernel(ctx: &ExecutionContext<'_>) -> Result<(), FrameworkError> {
    let op = ctx.op();
    let scale = op.attr_f32("scale")?;
    let bias = op.attr_f32("bias").unwrap_or(0.0);
    let x = ctx.input_tensor("X")?;
    ctx.set_output("Out", x.map_f32(|v| v * scale + bias)?)
}

pub(crate) fn scale_grad_maker(
    ctx: &mut GradOpMakerContext<'_>,
) -> Result<Vec<OpDesc>, FrameworkError> {
    let scale = ctx.fwd.attr_f32("scale")?;
    let out_grad = ctx.output_grad("Out");
    let x_grad = ctx.input_grad("X", false);
    Ok(vec![
        OpDesc::new("scale")
            .with_input("X", out_grad)
            .with_output("Out", x_grad)
            .with_attr("scale", Attribute::Float(scale)),
    ])
}

/// Sum of every tensor bound to `X`.
pub(crate) fn sum_kernel(ctx: &ExecutionContext<'_>) -> Result<(), FrameworkError> {
    let inputs = ctx.input_tensors("X")?;
    let (first, rest) = inputs.split_first().ok_or_else(|| FrameworkError::InvalidOperand {
        op_type: ctx.op().op_type.clone(),
        name: "X".to_string(),
        reason: "sum needs at least one input".to_string(),
    })?;
    let mut acc = first.map_f32(|v| v)?;
    for t in rest {
        acc.add_assign(t)?;
    }
    ctx.set_output("Out", acc)
}

pub(crate) fn sum_grad_maker(
    ctx: &mut GradOpMakerContext<'_>,
) -> Result<Vec<OpDesc>, FrameworkError> {
    let out_grad = ctx.output_grad("Out");
    let x_grad = ctx.input_grad("X", false);
    Ok(vec![
        OpDesc::new("sum_grad")
            .with_input("Out@GRAD", out_grad)
            .with_output("X@GRAD", x_grad),
    ])
}

pub(crate) fn sum_grad_kernel(ctx: &ExecutionContext<'_>) -> Result<(), FrameworkError> {
    let dout = ctx.input_tensor("Out@GRAD")?;
    for i in 0..ctx.output_count("X@GRAD") {
        ctx.set_output_at("X@GRAD", i, dout.clone())?;
    }
    Ok(())
}

/// `Out = X`, aliasing the buffer. Tensor lists are copied element-wise.
pub(crate) fn assign_kernel(ctx: &ExecutionContext<'_>) -> Result<(), FrameworkError> {
    let src = ctx.input_var("X", 0)?;
    let value = src.borrow().clone();
    if !value.is_initialized() {
        return Err(FrameworkError::InvalidOperand {
            op_type: ctx.op().op_type.clone(),
            name: "X".to_string(),
            reason: "assign source is not initialized".to_string(),
        });
    }
    *ctx.output_var("Out", 0)?.borrow_mut() = value;
    Ok(())
}

pub(crate) fn assign_grad_maker(
    ctx: &mut GradOpMakerContext<'_>,
) -> Result<Vec<OpDesc>, FrameworkError> {
    let out_grad = ctx.output_grad("Out");
    let x_grad = ctx.input_grad("X", false);
    Ok(vec![
        OpDesc::new("assign")
            .with_input("X", out_grad)
            .with_output("Out", x_grad),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuDeviceContext;
    use crate::dispatch::RuntimeContext;
    use crate::tensor::DenseTensor;
    use crate::variable::{SharedVar, Variable};
    use approx::assert_relative_eq;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    fn var(t: DenseTensor) -> SharedVar {
        Rc::new(RefCell::new(Variable::Tensor(t)))
    }

    fn run(
        kernel: fn(&ExecutionContext<'_>) -> Result<(), FrameworkError>,
        op: &OpDesc,
        inputs: Vec<(&str, Vec<SharedVar>)>,
        outputs: Vec<(&str, Vec<SharedVar>)>,
    ) -> Result<(), FrameworkError> {
        let to_map = |pairs: Vec<(&str, Vec<SharedVar>)>| {
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>()
        };
        let ctx = RuntimeContext::new(to_map(inputs), to_map(outputs));
        let dev = CpuDeviceContext;
        kernel(&ExecutionContext::new(op, &ctx, &dev))
    }

    #[test]
    fn test_mul_grad() {
        let x = var(DenseTensor::from_f32(vec![2.0, 3.0], &[2]).unwrap());
        let y = var(DenseTensor::from_f32(vec![5.0, 7.0], &[2]).unwrap());
        let dout = var(DenseTensor::from_f32(vec![1.0, 2.0], &[2]).unwrap());
        let dx = Rc::new(RefCell::new(Variable::Empty));
        let dy = Rc::new(RefCell::new(Variable::Empty));

        run(
            mul_grad_kernel,
            &OpDesc::new("elementwise_mul_grad"),
            vec![("X", vec![x]), ("Y", vec![y]), ("Out@GRAD", vec![dout])],
            vec![("X@GRAD", vec![dx.clone()]), ("Y@GRAD", vec![dy.clone()])],
        )
        .unwrap();

        assert_eq!(dx.borrow().tensor().unwrap().as_f32().unwrap(), &[5.0, 14.0]);
        assert_eq!(dy.borrow().tensor().unwrap().as_f32().unwrap(), &[2.0, 6.0]);
    }

    #[test]
    fn test_scale_with_bias() {
        let x = var(DenseTensor::from_f32(vec![1.0, -1.0], &[2]).unwrap());
        let out = Rc::new(RefCell::new(Variable::Empty));
        let op = OpDesc::new("scale")
            .with_attr("scale", Attribute::Float(0.5))
            .with_attr("bias", Attribute::Float(1.0));
        run(scale_kernel, &op, vec![("X", vec![x])], vec![("Out", vec![out.clone()])]).unwrap();

        let out = out.borrow();
        let data = out.tensor().unwrap().as_f32().unwrap();
        assert_relative_eq!(data[0], 1.5);
        assert_relative_eq!(data[1], 0.5);
    }

    #[test]
    fn test_sum_in_place_accumulator() {
        let acc = var(DenseTensor::from_f32(vec![1.0], &[1]).unwrap());
        let g = var(DenseTensor::from_f32(vec![2.0], &[1]).unwrap());
        run(
            sum_kernel,
            &OpDesc::new("sum"),
            vec![("X", vec![acc.clone(), g])],
            vec![("Out", vec![acc.clone()])],
        )
        .unwrap();
        assert_eq!(acc.borrow().tensor().unwrap().as_f32().unwrap(), &[3.0]);
    }

    #[test]
    fn test_add_shape_mismatch() {
        let x = var(DenseTensor::from_f32(vec![1.0, 2.0], &[2]).unwrap());
        let y = var(DenseTensor::from_f32(vec![1.0, 2.0, 3.0], &[3]).unwrap());
        let out = Rc::new(RefCell::new(Variable::Empty));
        let result = run(
            add_kernel,
            &OpDesc::new("elementwise_add"),
            vec![("X", vec![x]), ("Y", vec![y])],
            vec![("Out", vec![out])],
        );
        assert!(matches!(result, Err(FrameworkError::ShapeMismatch { .. })));
    }
}
