//! Type-tagged variable container.

use crate::error::FrameworkError;
use crate::scope::ScopeId;
use crate::tensor::DenseTensor;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Kind of value a variable holds (or is declared to hold).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VarType {
    #[default]
    DenseTensor,
    TensorList,
    StepScopes,
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VarType::DenseTensor => "dense_tensor",
            VarType::TensorList => "tensor_list",
            VarType::StepScopes => "step_scopes",
        };
        f.write_str(name)
    }
}

/// A named slot's content. `Empty` is the only uninitialized state.
#[derive(Debug, Clone, Default)]
pub enum Variable {
    #[default]
    Empty,
    Tensor(DenseTensor),
    TensorList(Vec<DenseTensor>),
    StepScopes(Vec<ScopeId>),
}

/// Variable handle shared between a scope (or tracked value) and running kernels.
pub type SharedVar = Rc<RefCell<Variable>>;

/// Allocate a fresh, uninitialized shared variable.
pub fn new_shared_var() -> SharedVar {
    Rc::new(RefCell::new(Variable::Empty))
}

impl Variable {
    pub fn is_initialized(&self) -> bool {
        !matches!(self, Variable::Empty)
    }

    pub fn var_type(&self) -> Option<VarType> {
        match self {
            Variable::Empty => None,
            Variable::Tensor(_) => Some(VarType::DenseTensor),
            Variable::TensorList(_) => Some(VarType::TensorList),
            Variable::StepScopes(_) => Some(VarType::StepScopes),
        }
    }

    fn mismatch(&self, name: &str, expected: VarType) -> FrameworkError {
        FrameworkError::TypeMismatch {
            name: name.to_string(),
            expected: expected.to_string(),
            actual: self
                .var_type()
                .map_or_else(|| "uninitialized".to_string(), |t| t.to_string()),
        }
    }

    pub fn tensor(&self) -> Option<&DenseTensor> {
        match self {
            Variable::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Tensor content of the variable called `name`.
    ///
    /// # Errors
    ///
    /// Returns `TypeMismatch` unless the variable holds a dense tensor.
    pub fn get_tensor(&self, name: &str) -> Result<&DenseTensor, FrameworkError> {
        self.tensor()
            .ok_or_else(|| self.mismatch(name, VarType::DenseTensor))
    }

    pub fn set_tensor(&mut self, tensor: DenseTensor) {
        *self = Variable::Tensor(tensor);
    }

    pub fn get_tensor_list(&self, name: &str) -> Result<&[DenseTensor], FrameworkError> {
        match self {
            Variable::TensorList(list) => Ok(list),
            _ => Err(self.mismatch(name, VarType::TensorList)),
        }
    }

    /// List content, turning an empty variable into an empty list first.
    pub fn tensor_list_mut(&mut self, name: &str) -> Result<&mut Vec<DenseTensor>, FrameworkError> {
        if let Variable::Empty = self {
            *self = Variable::TensorList(Vec::new());
        }
        match self {
            Variable::TensorList(list) => Ok(list),
            other => Err(other.mismatch(name, VarType::TensorList)),
        }
    }

    pub fn get_step_scopes(&self, name: &str) -> Result<&[ScopeId], FrameworkError> {
        match self {
            Variable::StepScopes(scopes) => Ok(scopes),
            _ => Err(self.mismatch(name, VarType::StepScopes)),
        }
    }

    /// Step-scope list, turning an empty variable into an empty list first.
    pub fn step_scopes_mut(&mut self, name: &str) -> Result<&mut Vec<ScopeId>, FrameworkError> {
        if let Variable::Empty = self {
            *self = Variable::StepScopes(Vec::new());
        }
        match self {
            Variable::StepScopes(scopes) => Ok(scopes),
            other => Err(other.mismatch(name, VarType::StepScopes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_uninitialized() {
        let var = Variable::default();
        assert!(!var.is_initialized());
        assert_eq!(var.var_type(), None);
        assert!(var.get_tensor("x").is_err());
    }

    #[test]
    fn test_tensor_list_mut_promotes_empty() {
        let mut var = Variable::Empty;
        var.tensor_list_mut("xs").unwrap().push(DenseTensor::scalar_f32(1.0));
        assert_eq!(var.var_type(), Some(VarType::TensorList));
        assert_eq!(var.get_tensor_list("xs").unwrap().len(), 1);
    }

    #[test]
    fn test_wrong_type_reported() {
        let mut var = Variable::Tensor(DenseTensor::scalar_f32(1.0));
        let err = var.step_scopes_mut("s").unwrap_err();
        assert!(err.to_string().contains("dense_tensor"));
    }
}
