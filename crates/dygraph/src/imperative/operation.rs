//! Recorded forward operations.

use super::custom::CustomFunction;
use super::value::{ProducerLink, ValueId};
use crate::desc::{BlockId, OpDesc};
use crate::variable::SharedVar;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Handle of an [`Operation`] in its tracer's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub(crate) usize);

impl OpId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Slot name → values bound to it.
pub type ValueMap = BTreeMap<String, Vec<ValueId>>;

/// Slot name → variables bound to it.
pub type VarMap = BTreeMap<String, Vec<SharedVar>>;

/// How an operation is differentiated.
#[derive(Clone)]
pub enum BackwardKind {
    /// Traced with `stop_gradient`.
    None,
    /// Run the registry-made backward descriptor.
    Registry,
    /// Call the custom function's backward.
    Custom(Rc<dyn CustomFunction>),
}

impl fmt::Debug for BackwardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackwardKind::None => f.write_str("None"),
            BackwardKind::Registry => f.write_str("Registry"),
            BackwardKind::Custom(func) => write!(f, "Custom({})", func.name()),
        }
    }
}

/// One traced forward call.
#[derive(Debug)]
pub struct Operation {
    pub(crate) id: OpId,
    pub(crate) desc: OpDesc,
    pub(crate) block: BlockId,
    pub(crate) inputs: ValueMap,
    pub(crate) outputs: ValueMap,
    /// Per input slot, the producer of each bound value (`None` for leaves
    /// and values that stop gradients).
    pub(crate) pre_ops: BTreeMap<String, Vec<Option<ProducerLink>>>,
    pub(crate) grad_op_desc: Option<OpDesc>,
    pub(crate) grad_input_vars: VarMap,
    pub(crate) grad_output_vars: VarMap,
    pub(crate) backward: BackwardKind,
}

impl Operation {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn desc(&self) -> &OpDesc {
        &self.desc
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn inputs(&self) -> &ValueMap {
        &self.inputs
    }

    pub fn outputs(&self) -> &ValueMap {
        &self.outputs
    }

    pub fn pre_ops(&self) -> &BTreeMap<String, Vec<Option<ProducerLink>>> {
        &self.pre_ops
    }

    /// Distinct producing operations over all input slots.
    pub fn predecessors(&self) -> Vec<OpId> {
        let mut ops: Vec<OpId> = self
            .pre_ops
            .values()
            .flatten()
            .flatten()
            .map(|link| link.op)
            .collect();
        ops.sort_unstable();
        ops.dedup();
        ops
    }

    pub fn grad_op_desc(&self) -> Option<&OpDesc> {
        self.grad_op_desc.as_ref()
    }

    pub fn grad_input_vars(&self) -> &VarMap {
        &self.grad_input_vars
    }

    pub fn grad_output_vars(&self) -> &VarMap {
        &self.grad_output_vars
    }

    pub fn backward(&self) -> &BackwardKind {
        &self.backward
    }
}
