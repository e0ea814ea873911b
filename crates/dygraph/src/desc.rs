//! Operator, variable and block descriptors.
//!
//! Descriptors are plain data produced by an external front end. A
//! [`ProgramDesc`] owns its blocks; blocks refer to each other through
//! [`BlockId`] so that nesting (parent) and gradient pairing (forward block)
//! can be followed in both directions without shared ownership.

use crate::error::FrameworkError;
use crate::tensor::{DataType, Dims};
use crate::variable::VarType;
use std::collections::BTreeMap;

/// Suffix appended to a variable name to form its gradient's name.
pub const GRAD_SUFFIX: &str = "@GRAD";

/// Placeholder for a gradient that is never produced.
pub const EMPTY_VAR_NAME: &str = "@EMPTY@";

/// Name of the gradient variable of `name`.
///
/// # Example
///
/// ```
/// assert_eq!(dygraph::desc::grad_var_name("w"), "w@GRAD");
/// ```
pub fn grad_var_name(name: &str) -> String {
    format!("{name}{GRAD_SUFFIX}")
}

/// Index of a block inside its program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

/// Operator attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Bool(bool),
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Str(String),
    Strings(Vec<String>),
    Block(BlockId),
    DataType(DataType),
}

/// Static description of a variable inside a block.
#[derive(Debug, Clone, PartialEq)]
pub struct VarDesc {
    pub name: String,
    pub var_type: VarType,
    pub dtype: DataType,
    pub dims: Dims,
    pub persistable: bool,
}

impl VarDesc {
    /// Dense f32 variable with unknown dims.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            var_type: VarType::DenseTensor,
            dtype: DataType::F32,
            dims: Dims::new(),
            persistable: false,
        }
    }

    pub fn with_type(mut self, var_type: VarType) -> Self {
        self.var_type = var_type;
        self
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_dims(mut self, dims: &[usize]) -> Self {
        self.dims = Dims::from_slice(dims);
        self
    }
}

/// Description of one operator invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OpDesc {
    pub op_type: String,
    pub inputs: BTreeMap<String, Vec<String>>,
    pub outputs: BTreeMap<String, Vec<String>>,
    pub attrs: BTreeMap<String, Attribute>,
}

fn to_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}

impl OpDesc {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            ..Self::default()
        }
    }

    /// Builder form of [`set_input`](Self::set_input).
    pub fn with_input<I, S>(mut self, slot: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_input(slot, to_names(names));
        self
    }

    /// Builder form of [`set_output`](Self::set_output).
    pub fn with_output<I, S>(mut self, slot: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_output(slot, to_names(names));
        self
    }

    pub fn with_attr(mut self, name: &str, value: Attribute) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }

    pub fn set_input(&mut self, slot: &str, names: Vec<String>) {
        self.inputs.insert(slot.to_string(), names);
    }

    pub fn set_output(&mut self, slot: &str, names: Vec<String>) {
        self.outputs.insert(slot.to_string(), names);
    }

    /// Argument names bound to input `slot` (empty if the slot is unbound).
    pub fn input(&self, slot: &str) -> &[String] {
        self.inputs.get(slot).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Argument names bound to output `slot` (empty if the slot is unbound).
    pub fn output(&self, slot: &str) -> &[String] {
        self.outputs.get(slot).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every input argument name, in slot order.
    pub fn input_arg_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.values().flatten().map(String::as_str)
    }

    /// Every output argument name, in slot order.
    pub fn output_arg_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.values().flatten().map(String::as_str)
    }

    fn missing(&self, attr: &str) -> FrameworkError {
        FrameworkError::MissingAttribute {
            op_type: self.op_type.clone(),
            attr: attr.to_string(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(name)
    }

    pub fn attr_f32(&self, name: &str) -> Result<f32, FrameworkError> {
        match self.attrs.get(name) {
            Some(Attribute::Float(v)) => Ok(*v),
            Some(Attribute::Int(v)) => Ok(*v as f32),
            _ => Err(self.missing(name)),
        }
    }

    pub fn attr_ints(&self, name: &str) -> Result<&[i64], FrameworkError> {
        match self.attrs.get(name) {
            Some(Attribute::Ints(v)) => Ok(v),
            _ => Err(self.missing(name)),
        }
    }

    pub fn attr_strings(&self, name: &str) -> Result<&[String], FrameworkError> {
        match self.attrs.get(name) {
            Some(Attribute::Strings(v)) => Ok(v),
            _ => Err(self.missing(name)),
        }
    }

    pub fn attr_block(&self, name: &str) -> Result<BlockId, FrameworkError> {
        match self.attrs.get(name) {
            Some(Attribute::Block(id)) => Ok(*id),
            _ => Err(self.missing(name)),
        }
    }

    pub fn attr_dtype(&self, name: &str) -> Result<DataType, FrameworkError> {
        match self.attrs.get(name) {
            Some(Attribute::DataType(dtype)) => Ok(*dtype),
            _ => Err(self.missing(name)),
        }
    }
}

/// An ordered list of operators plus the variables they declare.
#[derive(Debug, Clone)]
pub struct BlockDesc {
    pub id: BlockId,
    pub parent: Option<BlockId>,
    /// For a gradient block, the forward block it differentiates.
    pub forward_block: Option<BlockId>,
    pub vars: BTreeMap<String, VarDesc>,
    pub ops: Vec<OpDesc>,
}

impl BlockDesc {
    /// Declare (or replace) a variable.
    pub fn add_var(&mut self, desc: VarDesc) {
        self.vars.insert(desc.name.clone(), desc);
    }

    pub fn append_op(&mut self, op: OpDesc) {
        self.ops.push(op);
    }

    pub fn find_var(&self, name: &str) -> Option<&VarDesc> {
        self.vars.get(name)
    }
}

/// A program: block 0 is the global block, every other block nests in it.
#[derive(Debug, Clone)]
pub struct ProgramDesc {
    blocks: Vec<BlockDesc>,
}

impl ProgramDesc {
    pub fn new() -> Self {
        Self {
            blocks: vec![BlockDesc {
                id: BlockId(0),
                parent: None,
                forward_block: None,
                vars: BTreeMap::new(),
                ops: Vec::new(),
            }],
        }
    }

    pub fn global_block(&self) -> BlockId {
        BlockId(0)
    }

    /// Append an empty block nested in `parent`.
    pub fn append_block(&mut self, parent: BlockId) -> Result<BlockId, FrameworkError> {
        self.block(parent)?;
        let id = BlockId(self.blocks.len());
        self.blocks.push(BlockDesc {
            id,
            parent: Some(parent),
            forward_block: None,
            vars: BTreeMap::new(),
            ops: Vec::new(),
        });
        Ok(id)
    }

    /// Append a gradient block for `forward`, nested in `parent`.
    pub fn append_grad_block(
        &mut self,
        parent: BlockId,
        forward: BlockId,
    ) -> Result<BlockId, FrameworkError> {
        self.block(forward)?;
        let id = self.append_block(parent)?;
        self.block_mut(id)?.forward_block = Some(forward);
        Ok(id)
    }

    pub fn block(&self, id: BlockId) -> Result<&BlockDesc, FrameworkError> {
        self.blocks.get(id.0).ok_or_else(|| FrameworkError::InvalidBlock {
            message: format!("block {} does not exist", id.0),
        })
    }

    pub fn block_mut(&mut self, id: BlockId) -> Result<&mut BlockDesc, FrameworkError> {
        self.blocks
            .get_mut(id.0)
            .ok_or_else(|| FrameworkError::InvalidBlock {
                message: format!("block {} does not exist", id.0),
            })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn owner_of(&self, block: BlockId, name: &str) -> Option<BlockId> {
        let mut current = Some(block);
        while let Some(id) = current {
            let desc = self.blocks.get(id.0)?;
            if desc.vars.contains_key(name) {
                return Some(id);
            }
            current = desc.parent;
        }
        None
    }

    /// Variable `name` in `block` or the nearest enclosing block.
    pub fn find_var_recursive(&self, block: BlockId, name: &str) -> Option<&VarDesc> {
        let owner = self.owner_of(block, name)?;
        self.blocks[owner.0].vars.get(name)
    }

    pub fn find_var_recursive_mut(&mut self, block: BlockId, name: &str) -> Option<&mut VarDesc> {
        let owner = self.owner_of(block, name)?;
        self.blocks[owner.0].vars.get_mut(name)
    }

    /// Variable `name` visible from `block`, declared in `block` if absent.
    pub fn find_recursive_or_create_var(
        &mut self,
        block: BlockId,
        name: &str,
    ) -> Result<&mut VarDesc, FrameworkError> {
        let owner = match self.owner_of(block, name) {
            Some(owner) => owner,
            None => {
                self.block_mut(block)?.add_var(VarDesc::new(name));
                block
            }
        };
        self.block_mut(owner)?
            .vars
            .get_mut(name)
            .ok_or_else(|| FrameworkError::not_found(name))
    }
}

impl Default for ProgramDesc {
    fn default() -> Self {
        Self::new()
    }
}
