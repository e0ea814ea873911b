//! Operator registry and gradient makers.
//!
//! The registry is a read-mostly table: build it once (usually with
//! [`OpRegistry::with_builtin_ops`]) and hand out `&OpRegistry` to every
//! tracer and executor.

use crate::desc::{BlockId, EMPTY_VAR_NAME, OpDesc, ProgramDesc, grad_var_name};
use crate::dispatch::ExecutionContext;
use crate::error::FrameworkError;
use crate::executor::Executor;
use crate::scope::{ScopeId, ScopeTree};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Compute kernel.
pub type KernelFn = Arc<dyn Fn(&ExecutionContext<'_>) -> Result<(), FrameworkError> + Send + Sync>;

/// Operator composed of a sub-block, run by an [`Executor`] inside a scope.
pub type BlockOpFn = fn(
    &Executor<'_>,
    &OpDesc,
    &ProgramDesc,
    &mut ScopeTree,
    ScopeId,
) -> Result<(), FrameworkError>;

/// Maps every gradient name a maker emits back to its forward variable.
pub type GradToVar = HashMap<String, String>;

/// Builds the backward descriptor(s) of a forward operator.
pub type GradOpMaker =
    Arc<dyn Fn(&mut GradOpMakerContext<'_>) -> Result<Vec<OpDesc>, FrameworkError> + Send + Sync>;

/// Compile-time shape or var-type inference against the enclosing block.
pub type InferFn = fn(&OpDesc, &mut ProgramDesc, BlockId) -> Result<(), FrameworkError>;

/// Capability of a registered operator.
#[derive(Clone)]
pub enum OpKind {
    /// Runs a kernel through the dispatcher.
    Kernel(KernelFn),
    /// Runs a sub-block through the executor.
    Block(BlockOpFn),
    /// Has a descriptor (and maybe a gradient maker) but cannot run.
    DescriptorOnly,
}

impl fmt::Debug for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Kernel(_) => f.write_str("Kernel"),
            OpKind::Block(_) => f.write_str("Block"),
            OpKind::DescriptorOnly => f.write_str("DescriptorOnly"),
        }
    }
}

/// Everything the registry knows about one operator type.
#[derive(Clone)]
pub struct OpInfo {
    pub kind: OpKind,
    pub grad_maker: Option<GradOpMaker>,
    pub infer_shape: Option<InferFn>,
    pub infer_var_type: Option<InferFn>,
}

impl OpInfo {
    pub fn kernel<F>(kernel: F) -> Self
    where
        F: Fn(&ExecutionContext<'_>) -> Result<(), FrameworkError> + Send + Sync + 'static,
    {
        Self::with_kind(OpKind::Kernel(Arc::new(kernel)))
    }

    pub fn block(run: BlockOpFn) -> Self {
        Self::with_kind(OpKind::Block(run))
    }

    pub fn descriptor_only() -> Self {
        Self::with_kind(OpKind::DescriptorOnly)
    }

    fn with_kind(kind: OpKind) -> Self {
        Self {
            kind,
            grad_maker: None,
            infer_shape: None,
            infer_var_type: None,
        }
    }

    pub fn with_grad_maker<F>(mut self, maker: F) -> Self
    where
        F: Fn(&mut GradOpMakerContext<'_>) -> Result<Vec<OpDesc>, FrameworkError>
            + Send
            + Sync
            + 'static,
    {
        self.grad_maker = Some(Arc::new(maker));
        self
    }

    pub fn with_infer_shape(mut self, infer: InferFn) -> Self {
        self.infer_shape = Some(infer);
        self
    }

    pub fn with_infer_var_type(mut self, infer: InferFn) -> Self {
        self.infer_var_type = Some(infer);
        self
    }
}

impl fmt::Debug for OpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpInfo")
            .field("kind", &self.kind)
            .field("has_grad_maker", &self.grad_maker.is_some())
            .finish()
    }
}

/// An operator descriptor paired with its registered capability.
#[derive(Debug, Clone)]
pub struct OperatorInstance {
    pub desc: OpDesc,
    pub kind: OpKind,
}

/// Inputs to a gradient maker.
pub struct GradOpMakerContext<'a> {
    pub fwd: &'a OpDesc,
    pub no_grad_set: &'a HashSet<String>,
    pub grad_blocks: &'a [BlockId],
    pub program: &'a ProgramDesc,
    pub grad_to_var: &'a mut GradToVar,
}

impl GradOpMakerContext<'_> {
    /// Forward input names of `slot`.
    pub fn input(&self, slot: &str) -> Vec<String> {
        self.fwd.input(slot).to_vec()
    }

    /// Forward output names of `slot`.
    pub fn output(&self, slot: &str) -> Vec<String> {
        self.fwd.output(slot).to_vec()
    }

    fn grads_of(&mut self, names: &[String], keep_empty: bool) -> Vec<String> {
        let mut grads = Vec::with_capacity(names.len());
        for name in names {
            if self.no_grad_set.contains(name) {
                if keep_empty {
                    grads.push(EMPTY_VAR_NAME.to_string());
                }
                continue;
            }
            let grad = grad_var_name(name);
            self.grad_to_var.insert(grad.clone(), name.clone());
            grads.push(grad);
        }
        grads
    }

    /// Gradient names for forward input `slot`; entries in the no-grad set
    /// become [`EMPTY_VAR_NAME`] when `keep_empty`, else are dropped.
    pub fn input_grad(&mut self, slot: &str, keep_empty: bool) -> Vec<String> {
        let names = self.fwd.input(slot).to_vec();
        self.grads_of(&names, keep_empty)
    }

    /// Gradient names for forward output `slot`.
    pub fn output_grad(&mut self, slot: &str) -> Vec<String> {
        let names = self.fwd.output(slot).to_vec();
        self.grads_of(&names, false)
    }

    pub fn grad_block(&self, index: usize) -> Result<BlockId, FrameworkError> {
        self.grad_blocks
            .get(index)
            .copied()
            .ok_or_else(|| FrameworkError::InvalidBlock {
                message: format!(
                    "gradient maker for `{}` needs grad block {index}",
                    self.fwd.op_type
                ),
            })
    }
}

/// Operator type → capability, gradient maker and inference hooks.
#[derive(Debug, Default)]
pub struct OpRegistry {
    ops: HashMap<String, OpInfo>,
}

impl OpRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every builtin operator.
    pub fn with_builtin_ops() -> Self {
        let mut registry = Self::new();
        crate::ops::register_builtin_ops(&mut registry);
        registry
    }

    /// Register `info` under `op_type`, replacing any earlier entry.
    pub fn register(&mut self, op_type: &str, info: OpInfo) {
        self.ops.insert(op_type.to_string(), info);
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.ops.contains_key(op_type)
    }

    /// # Errors
    ///
    /// Returns `UnknownOperator` if `op_type` is not registered.
    pub fn get(&self, op_type: &str) -> Result<&OpInfo, FrameworkError> {
        self.ops
            .get(op_type)
            .ok_or_else(|| FrameworkError::UnknownOperator {
                op_type: op_type.to_string(),
                reason: "not registered".to_string(),
            })
    }

    /// Pair `desc` with its registered capability.
    pub fn create_op(&self, desc: &OpDesc) -> Result<OperatorInstance, FrameworkError> {
        let info = self.get(&desc.op_type)?;
        Ok(OperatorInstance {
            desc: desc.clone(),
            kind: info.kind.clone(),
        })
    }

    /// Run the registered shape and var-type inference hooks for `op`.
    pub fn infer(
        &self,
        op: &OpDesc,
        program: &mut ProgramDesc,
        block: BlockId,
    ) -> Result<(), FrameworkError> {
        let info = self.get(&op.op_type)?;
        if let Some(infer_shape) = info.infer_shape {
            infer_shape(op, program, block)?;
        }
        if let Some(infer_var_type) = info.infer_var_type {
            infer_var_type(op, program, block)?;
        }
        Ok(())
    }

    /// Backward descriptors of `fwd`, in order. Empty when the operator has
    /// no gradient maker.
    pub fn grad_op_descs(
        &self,
        fwd: &OpDesc,
        no_grad_set: &HashSet<String>,
        grad_blocks: &[BlockId],
        program: &ProgramDesc,
        grad_to_var: &mut GradToVar,
    ) -> Result<Vec<OpDesc>, FrameworkError> {
        let info = self.get(&fwd.op_type)?;
        let Some(maker) = info.grad_maker.as_ref() else {
            return Ok(Vec::new());
        };
        let mut ctx = GradOpMakerContext {
            fwd,
            no_grad_set,
            grad_blocks,
            program,
            grad_to_var,
        };
        maker(&mut ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_operator() {
        let registry = OpRegistry::new();
        let desc = OpDesc::new("conv9d");
        assert!(matches!(
            registry.create_op(&desc),
            Err(FrameworkError::UnknownOperator { .. })
        ));
    }

    #[test]
    fn test_grad_maker_records_grad_to_var() {
        let mut registry = OpRegistry::new();
        registry.register(
            "identity",
            OpInfo::kernel(|_| Ok(())).with_grad_maker(|ctx| {
                let out_grad = ctx.output_grad("Out");
                let x_grad = ctx.input_grad("X", false);
                Ok(vec![
                    OpDesc::new("identity")
                        .with_input("X", out_grad)
                        .with_output("Out", x_grad),
                ])
            }),
        );

        let fwd = OpDesc::new("identity")
            .with_input("X", ["a"])
            .with_output("Out", ["b"]);
        let program = ProgramDesc::new();
        let mut grad_to_var = GradToVar::new();
        let grads = registry
            .grad_op_descs(&fwd, &HashSet::new(), &[], &program, &mut grad_to_var)
            .unwrap();

        assert_eq!(grads.len(), 1);
        assert_eq!(grads[0].input("X"), &["b@GRAD".to_string()]);
        assert_eq!(grad_to_var.get("a@GRAD").map(String::as_str), Some("a"));
        assert_eq!(grad_to_var.get("b@GRAD").map(String::as_str), Some("b"));
    }

    #[test]
    fn test_no_grad_set_yields_empty_sentinel() {
        let fwd = OpDesc::new("mul").with_input("X", ["a", "b"]);
        let program = ProgramDesc::new();
        let no_grad: HashSet<String> = ["b".to_string()].into_iter().collect();
        let mut grad_to_var = GradToVar::new();
        let mut ctx = GradOpMakerContext {
            fwd: &fwd,
            no_grad_set: &no_grad,
            grad_blocks: &[],
            program: &program,
            grad_to_var: &mut grad_to_var,
        };
        assert_eq!(ctx.input_grad("X", true), vec!["a@GRAD", EMPTY_VAR_NAME]);
        assert_eq!(ctx.input_grad("X", false), vec!["a@GRAD"]);
        assert!(ctx.grad_block(0).is_err());
    }

    #[test]
    fn test_missing_grad_maker_yields_nothing() {
        let mut registry = OpRegistry::new();
        registry.register("print", OpInfo::descriptor_only());
        let program = ProgramDesc::new();
        let grads = registry
            .grad_op_descs(
                &OpDesc::new("print"),
                &HashSet::new(),
                &[],
                &program,
                &mut GradToVar::new(),
            )
            .unwrap();
        assert!(grads.is_empty());
    }
}
