//! Comparison and counter kernels used to drive loop conditions.

use crate::dispatch::ExecutionContext;
use crate::error::FrameworkError;
use crate::tensor::{DataType, DenseTensor};

/// `Out[i] = X[i] < Y[i]` for f32 or i64 operands; `Out` is bool.
pub(crate) fn less_than_kernel(ctx: &ExecutionContext<'_>) -> Result<(), FrameworkError> {
    let x = ctx.input_tensor("X")?;
    let y = ctx.input_tensor("Y")?;
    if x.dims() != y.dims() {
        return Err(FrameworkError::shape_mismatch("less_than.Y", x.dims(), y.dims()));
    }
    let data: Vec<bool> = match (x.dtype(), y.dtype()) {
        (DataType::F32, DataType::F32) => x
            .as_f32()?
            .iter()
            .zip(y.as_f32()?)
            .map(|(a, b)| a < b)
            .collect(),
        (DataType::I64, DataType::I64) => x
            .as_i64()?
            .iter()
            .zip(y.as_i64()?)
            .map(|(a, b)| a < b)
            .collect(),
        (lhs, rhs) => {
            return Err(FrameworkError::TypeMismatch {
                name: "less_than.Y".to_string(),
                expected: lhs.to_string(),
                actual: rhs.to_string(),
            });
        }
    };
    let out = DenseTensor::from_bool(data, x.dims())?.with_place(x.place());
    ctx.set_output("Out", out)
}

/// `Out = X + step` (attribute `step`, default 1). `X` and `Out` may alias.
pub(crate) fn increment_kernel(ctx: &ExecutionContext<'_>) -> Result<(), FrameworkError> {
    let step = ctx.op().attr_f32("step").unwrap_or(1.0);
    let x = ctx.input_tensor("X")?;
    let out = match x.dtype() {
        DataType::F32 => x.map_f32(|v| v + step)?,
        DataType::I64 => {
            let data = x.as_i64()?.iter().map(|&v| v + step as i64).collect();
            DenseTensor::from_i64(data, x.dims())?.with_place(x.place())
        }
        DataType::Bool => {
            return Err(FrameworkError::TypeMismatch {
                name: "increment.X".to_string(),
                expected: "f32 or i64".to_string(),
                actual: DataType::Bool.to_string(),
            });
        }
    };
    ctx.set_output("Out", out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::OpDesc;
    use crate::device::CpuDeviceContext;
    use crate::dispatch::RuntimeContext;
    use crate::variable::Variable;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    #[test]
    fn test_increment_in_place_then_compare() {
        let i = Rc::new(RefCell::new(Variable::Tensor(
            DenseTensor::from_i64(vec![0], &[1]).unwrap(),
        )));
        let n = Rc::new(RefCell::new(Variable::Tensor(
            DenseTensor::from_i64(vec![1], &[1]).unwrap(),
        )));
        let cond = Rc::new(RefCell::new(Variable::Empty));
        let dev = CpuDeviceContext;

        let inc_ctx = RuntimeContext::new(
            BTreeMap::from([("X".to_string(), vec![i.clone()])]),
            BTreeMap::from([("Out".to_string(), vec![i.clone()])]),
        );
        let inc = OpDesc::new("increment");
        increment_kernel(&ExecutionContext::new(&inc, &inc_ctx, &dev)).unwrap();
        assert_eq!(i.borrow().tensor().unwrap().as_i64().unwrap(), &[1]);

        let lt_ctx = RuntimeContext::new(
            BTreeMap::from([
                ("X".to_string(), vec![i.clone()]),
                ("Y".to_string(), vec![n]),
            ]),
            BTreeMap::from([("Out".to_string(), vec![cond.clone()])]),
        );
        let lt = OpDesc::new("less_than");
        less_than_kernel(&ExecutionContext::new(&lt, &lt_ctx, &dev)).unwrap();
        assert_eq!(cond.borrow().tensor().unwrap().as_bool().unwrap(), &[false]);
    }
}
