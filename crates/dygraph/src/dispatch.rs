//! Kernel preparation and execution.
//!
//! ```text
//! OperatorInstance ──prepare(ctx, place)──► PreparedOp { kernel, dev_ctx, ctx }
//!                                                │
//!                                             run() ──► ExecutionContext ──► KernelFn
//! ```

use crate::device::{DeviceContext, DeviceContextPool, Place};
use crate::desc::OpDesc;
use crate::error::FrameworkError;
use crate::registry::{KernelFn, OpKind, OperatorInstance};
use crate::tensor::DenseTensor;
use crate::variable::SharedVar;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Variables bound to an operator's slots for one run.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    pub inputs: BTreeMap<String, Vec<SharedVar>>,
    pub outputs: BTreeMap<String, Vec<SharedVar>>,
}

impl RuntimeContext {
    pub fn new(
        inputs: BTreeMap<String, Vec<SharedVar>>,
        outputs: BTreeMap<String, Vec<SharedVar>>,
    ) -> Self {
        Self { inputs, outputs }
    }
}

/// What a kernel sees while running.
pub struct ExecutionContext<'a> {
    op: &'a OpDesc,
    ctx: &'a RuntimeContext,
    dev_ctx: &'a dyn DeviceContext,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(op: &'a OpDesc, ctx: &'a RuntimeContext, dev_ctx: &'a dyn DeviceContext) -> Self {
        Self { op, ctx, dev_ctx }
    }

    /// Descriptor of the running operator (attributes, argument names).
    pub fn op(&self) -> &OpDesc {
        self.op
    }

    pub fn place(&self) -> Place {
        self.dev_ctx.place()
    }

    pub fn device_context(&self) -> &dyn DeviceContext {
        self.dev_ctx
    }

    fn operand_error(&self, name: &str, reason: &str) -> FrameworkError {
        FrameworkError::InvalidOperand {
            op_type: self.op.op_type.clone(),
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn has_input(&self, slot: &str) -> bool {
        self.ctx.inputs.get(slot).is_some_and(|v| !v.is_empty())
    }

    pub fn input_count(&self, slot: &str) -> usize {
        self.ctx.inputs.get(slot).map_or(0, Vec::len)
    }

    pub fn output_count(&self, slot: &str) -> usize {
        self.ctx.outputs.get(slot).map_or(0, Vec::len)
    }

    pub fn input_var(&self, slot: &str, index: usize) -> Result<SharedVar, FrameworkError> {
        self.ctx
            .inputs
            .get(slot)
            .and_then(|vars| vars.get(index))
            .cloned()
            .ok_or_else(|| self.operand_error(slot, "input slot is not bound"))
    }

    pub fn output_var(&self, slot: &str, index: usize) -> Result<SharedVar, FrameworkError> {
        self.ctx
            .outputs
            .get(slot)
            .and_then(|vars| vars.get(index))
            .cloned()
            .ok_or_else(|| self.operand_error(slot, "output slot is not bound"))
    }

    /// Tensor bound to `slot[index]`. The buffer is shared, not copied.
    pub fn input_tensor_at(&self, slot: &str, index: usize) -> Result<DenseTensor, FrameworkError> {
        let var = self.input_var(slot, index)?;
        let var = var.borrow();
        var.tensor()
            .cloned()
            .ok_or_else(|| self.operand_error(slot, "input is not an initialized tensor"))
    }

    pub fn input_tensor(&self, slot: &str) -> Result<DenseTensor, FrameworkError> {
        self.input_tensor_at(slot, 0)
    }

    /// Every tensor bound to `slot`, in order.
    pub fn input_tensors(&self, slot: &str) -> Result<Vec<DenseTensor>, FrameworkError> {
        (0..self.input_count(slot))
            .map(|i| self.input_tensor_at(slot, i))
            .collect()
    }

    pub fn set_output_at(
        &self,
        slot: &str,
        index: usize,
        tensor: DenseTensor,
    ) -> Result<(), FrameworkError> {
        self.output_var(slot, index)?.borrow_mut().set_tensor(tensor);
        Ok(())
    }

    pub fn set_output(&self, slot: &str, tensor: DenseTensor) -> Result<(), FrameworkError> {
        self.set_output_at(slot, 0, tensor)
    }
}

/// A kernel bound to its inputs, outputs and device context, ready to run.
pub struct PreparedOp {
    desc: OpDesc,
    kernel: KernelFn,
    dev_ctx: Arc<dyn DeviceContext>,
    ctx: RuntimeContext,
}

impl PreparedOp {
    pub fn run(&self) -> Result<(), FrameworkError> {
        let exec = ExecutionContext::new(&self.desc, &self.ctx, self.dev_ctx.as_ref());
        (self.kernel)(&exec)
    }

    pub fn device_context(&self) -> &Arc<dyn DeviceContext> {
        &self.dev_ctx
    }

    /// Give back the bound variables.
    pub fn into_context(self) -> RuntimeContext {
        self.ctx
    }
}

/// Resolves kernels for operator instances and owns the device-context pool.
#[derive(Debug, Clone, Default)]
pub struct KernelDispatcher {
    pool: DeviceContextPool,
}

impl KernelDispatcher {
    pub fn new(pool: DeviceContextPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DeviceContextPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut DeviceContextPool {
        &mut self.pool
    }

    /// Bind `op`'s kernel to `ctx` on `place`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownOperator` if `op` is not kernel-backed and
    /// `UnsupportedDevice` if no context serves `place`.
    pub fn prepare(
        &self,
        op: &OperatorInstance,
        ctx: RuntimeContext,
        place: Place,
    ) -> Result<PreparedOp, FrameworkError> {
        let kernel = match &op.kind {
            OpKind::Kernel(kernel) => Arc::clone(kernel),
            OpKind::Block(_) => {
                return Err(FrameworkError::UnknownOperator {
                    op_type: op.desc.op_type.clone(),
                    reason: "block-composed operators run through the executor".to_string(),
                });
            }
            OpKind::DescriptorOnly => {
                return Err(FrameworkError::UnknownOperator {
                    op_type: op.desc.op_type.clone(),
                    reason: "operator has no kernel".to_string(),
                });
            }
        };
        Ok(PreparedOp {
            desc: op.desc.clone(),
            kernel,
            dev_ctx: self.pool.get(place)?,
            ctx,
        })
    }

    /// Block until all work on `place` has completed.
    pub fn wait(&self, place: Place) -> Result<(), FrameworkError> {
        self.pool.get(place)?.wait();
        Ok(())
    }
}
