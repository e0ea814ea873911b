//! Values tracked by the tracer.

use super::operation::OpId;
use crate::desc::grad_var_name;
use crate::error::FrameworkError;
use crate::tensor::DenseTensor;
use crate::variable::{SharedVar, Variable, new_shared_var};
use std::rc::Rc;

/// Handle of a [`TrackedValue`] in its tracer's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) usize);

impl ValueId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Which operation output produced a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerLink {
    pub op: OpId,
    pub slot: String,
    pub index: usize,
}

/// A variable plus its gradient slot and producer back-reference.
#[derive(Debug)]
pub struct TrackedValue {
    name: String,
    var: SharedVar,
    grad: SharedVar,
    stop_gradient: bool,
    producer: Option<ProducerLink>,
}

impl TrackedValue {
    pub(crate) fn new(name: impl Into<String>, var: SharedVar) -> Self {
        Self {
            name: name.into(),
            var,
            grad: new_shared_var(),
            stop_gradient: false,
            producer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the gradient slot, `<name>@GRAD`.
    pub fn grad_name(&self) -> String {
        grad_var_name(&self.name)
    }

    pub fn var(&self) -> &SharedVar {
        &self.var
    }

    pub fn grad(&self) -> &SharedVar {
        &self.grad
    }

    pub fn is_initialized(&self) -> bool {
        self.var.borrow().is_initialized()
    }

    /// Owned copy of the value's tensor, sharing its buffer.
    pub fn tensor(&self) -> Option<DenseTensor> {
        self.var.borrow().tensor().cloned()
    }

    pub fn grad_tensor(&self) -> Option<DenseTensor> {
        self.grad.borrow().tensor().cloned()
    }

    pub fn stop_gradient(&self) -> bool {
        self.stop_gradient
    }

    pub fn set_stop_gradient(&mut self, stop_gradient: bool) {
        self.stop_gradient = stop_gradient;
    }

    pub fn producer(&self) -> Option<&ProducerLink> {
        self.producer.as_ref()
    }

    /// # Errors
    ///
    /// Returns `InvalidOperand` if the value already has a producer.
    pub(crate) fn set_producer(&mut self, link: ProducerLink) -> Result<(), FrameworkError> {
        if let Some(existing) = &self.producer {
            return Err(FrameworkError::InvalidOperand {
                op_type: format!("op#{}", link.op.index()),
                name: self.name.clone(),
                reason: format!(
                    "already produced by op#{} ({}[{}])",
                    existing.op.index(),
                    existing.slot,
                    existing.index
                ),
            });
        }
        self.producer = Some(link);
        Ok(())
    }

    /// Zero-fill the gradient slot to the value's shape and dtype unless it
    /// already holds data. Returns the slot.
    pub(crate) fn ensure_grad_initialized(&self) -> Result<SharedVar, FrameworkError> {
        if self.grad.borrow().is_initialized() {
            return Ok(Rc::clone(&self.grad));
        }
        let zeros = match &*self.var.borrow() {
            Variable::Tensor(t) => Variable::Tensor(DenseTensor::zeros_like(t)),
            Variable::TensorList(list) => {
                Variable::TensorList(list.iter().map(DenseTensor::zeros_like).collect())
            }
            Variable::Empty | Variable::StepScopes(_) => {
                return Err(FrameworkError::InvalidOperand {
                    op_type: "grad".to_string(),
                    name: self.name.clone(),
                    reason: "cannot shape a gradient for a value without tensor data".to_string(),
                });
            }
        };
        *self.grad.borrow_mut() = zeros;
        Ok(Rc::clone(&self.grad))
    }
}
