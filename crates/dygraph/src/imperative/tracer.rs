//! Graph-building tracer.
//!
//! Every traced call runs its forward kernel immediately and records an
//! [`Operation`] linking its inputs to the operations that produced them.
//! Unless the call stops gradients, the operator's backward descriptor is
//! built right away and its arguments are bound to concrete variables:
//! forward values by name, gradient names through the maker's grad-to-var
//! map onto the gradient slot of the matching forward value.

use super::custom::CustomFunction;
use super::engine;
use super::operation::{BackwardKind, OpId, Operation, ValueMap, VarMap};
use super::value::{ProducerLink, TrackedValue, ValueId};
use crate::config::RuntimeConfig;
use crate::desc::{BlockId, EMPTY_VAR_NAME, OpDesc, ProgramDesc, grad_var_name};
use crate::dispatch::{KernelDispatcher, RuntimeContext};
use crate::error::FrameworkError;
use crate::registry::{GradToVar, OpKind, OpRegistry, OperatorInstance};
use crate::tensor::DenseTensor;
use crate::variable::{SharedVar, VarType, Variable, new_shared_var};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use tracing::{debug, error, trace};

pub(super) const CUSTOM_X: &str = "X";
pub(super) const CUSTOM_OUT: &str = "Out";
pub(super) const CUSTOM_OUT_GRAD: &str = "Out@GRAD";
pub(super) const CUSTOM_X_GRAD: &str = "X@GRAD";

/// Records forward operations for later differentiation.
///
/// # Example
///
/// ```
/// use dygraph::{DenseTensor, OpDesc, OpRegistry, ProgramDesc, Tracer};
/// use std::collections::BTreeMap;
///
/// let registry = OpRegistry::with_builtin_ops();
/// let mut tracer = Tracer::new(&registry);
/// let mut program = ProgramDesc::new();
/// let block = program.global_block();
///
/// let a = tracer.create_value("a", DenseTensor::from_f32(vec![1.0, 2.0], &[2]).unwrap());
/// let b = tracer.create_value("b", DenseTensor::from_f32(vec![3.0, 4.0], &[2]).unwrap());
/// let c = tracer.create_output("c");
///
/// let op = OpDesc::new("add")
///     .with_input("X", ["a"])
///     .with_input("Y", ["b"])
///     .with_output("Out", ["c"]);
/// let inputs = BTreeMap::from([("X".to_string(), vec![a]), ("Y".to_string(), vec![b])]);
/// let outputs = BTreeMap::from([("Out".to_string(), vec![c])]);
/// tracer.trace(&op, &inputs, &outputs, &mut program, block, false).unwrap();
///
/// let sum = tracer.value(c).unwrap().tensor().unwrap();
/// assert_eq!(sum.as_f32().unwrap(), &[4.0, 6.0]);
/// ```
#[derive(Debug)]
pub struct Tracer<'r> {
    registry: &'r OpRegistry,
    dispatcher: KernelDispatcher,
    config: RuntimeConfig,
    values: Vec<TrackedValue>,
    ops: Vec<Operation>,
}

impl<'r> Tracer<'r> {
    pub fn new(registry: &'r OpRegistry) -> Self {
        Self::with_config(registry, RuntimeConfig::default())
    }

    pub fn with_config(registry: &'r OpRegistry, config: RuntimeConfig) -> Self {
        Self {
            registry,
            dispatcher: KernelDispatcher::default(),
            config,
            values: Vec::new(),
            ops: Vec::new(),
        }
    }

    /// Replace the dispatcher, e.g. to serve additional places.
    pub fn with_dispatcher(mut self, dispatcher: KernelDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn registry(&self) -> &'r OpRegistry {
        self.registry
    }

    pub fn dispatcher(&self) -> &KernelDispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// New leaf value holding `tensor`.
    pub fn create_value(&mut self, name: impl Into<String>, tensor: DenseTensor) -> ValueId {
        let var = Rc::new(RefCell::new(Variable::Tensor(tensor)));
        self.push_value(TrackedValue::new(name, var))
    }

    /// New uninitialized value, to be bound as an operation output.
    pub fn create_output(&mut self, name: impl Into<String>) -> ValueId {
        self.push_value(TrackedValue::new(name, new_shared_var()))
    }

    fn push_value(&mut self, value: TrackedValue) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(value);
        id
    }

    pub fn value(&self, id: ValueId) -> Result<&TrackedValue, FrameworkError> {
        self.values.get(id.0).ok_or_else(|| unknown_handle("value", id.0))
    }

    pub fn value_mut(&mut self, id: ValueId) -> Result<&mut TrackedValue, FrameworkError> {
        self.values
            .get_mut(id.0)
            .ok_or_else(|| unknown_handle("value", id.0))
    }

    pub fn op(&self, id: OpId) -> Result<&Operation, FrameworkError> {
        self.ops.get(id.0).ok_or_else(|| unknown_handle("op", id.0))
    }

    pub fn values(&self) -> &[TrackedValue] {
        &self.values
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    /// Run the backward pass from `root`, seeding its gradient with `seed`
    /// or ones.
    pub fn backward(&self, root: ValueId, seed: Option<DenseTensor>) -> Result<(), FrameworkError> {
        engine::run_backward(self, root, seed)
    }

    /// Run `desc` on the given values and record it.
    ///
    /// Argument names in `desc` must match the names of the values bound to
    /// the same slots; the backward descriptor refers to them by name.
    ///
    /// # Errors
    ///
    /// - `InvalidOperand` for an uninitialized input or an output that
    ///   already has a producer
    /// - `UnknownOperator` for unregistered, block-composed or
    ///   descriptor-only operators
    /// - `UnsupportedGradient` unless the operator yields exactly one
    ///   backward descriptor (when gradients are wanted)
    pub fn trace(
        &mut self,
        desc: &OpDesc,
        inputs: &ValueMap,
        outputs: &ValueMap,
        program: &mut ProgramDesc,
        block: BlockId,
        stop_gradient: bool,
    ) -> Result<OpId, FrameworkError> {
        debug!(op = %desc.op_type, stop_gradient, "tracing op");
        self.check_operands(&desc.op_type, inputs, outputs)?;
        self.declare_operands(inputs, outputs, program, block)?;
        self.registry.infer(desc, program, block)?;

        let instance = self.registry.create_op(desc)?;
        match &instance.kind {
            OpKind::Kernel(_) => {}
            OpKind::Block(_) => {
                return Err(FrameworkError::UnknownOperator {
                    op_type: desc.op_type.clone(),
                    reason: "block-composed operators cannot be traced".to_string(),
                });
            }
            OpKind::DescriptorOnly => {
                return Err(FrameworkError::UnknownOperator {
                    op_type: desc.op_type.clone(),
                    reason: "operator has no kernel".to_string(),
                });
            }
        }

        // Nothing below may touch the arena until every fallible step is done.
        let pre_ops = self.collect_pre_ops(inputs)?;
        let saved = self.snapshot(outputs)?;
        let executed = self.execute(&instance, desc, inputs, outputs, program, block, stop_gradient);
        let backward = match executed {
            Ok(backward) => backward,
            Err(err) => {
                for (var, old) in saved {
                    *var.borrow_mut() = old;
                }
                return Err(err);
            }
        };

        let id = OpId(self.ops.len());
        let mut op = Operation {
            id,
            desc: desc.clone(),
            block,
            inputs: inputs.clone(),
            outputs: outputs.clone(),
            pre_ops,
            grad_op_desc: None,
            grad_input_vars: VarMap::new(),
            grad_output_vars: VarMap::new(),
            backward: BackwardKind::None,
        };
        if let Some(binding) = backward {
            binding.attach(&mut op, BackwardKind::Registry);
        }
        self.mark_outputs(id, outputs, program, block, stop_gradient)?;
        self.ops.push(op);
        Ok(id)
    }

    /// Run the kernel and, when gradients are wanted, bind its backward op.
    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        instance: &OperatorInstance,
        desc: &OpDesc,
        inputs: &ValueMap,
        outputs: &ValueMap,
        program: &mut ProgramDesc,
        block: BlockId,
        stop_gradient: bool,
    ) -> Result<Option<GradBinding>, FrameworkError> {
        let ctx = RuntimeContext::new(self.bind(inputs)?, self.bind(outputs)?);
        self.dispatcher
            .prepare(instance, ctx, self.config.place)?
            .run()?;
        self.record_output_shapes(outputs, program, block)?;
        if stop_gradient {
            return Ok(None);
        }
        self.build_backward(desc, inputs, outputs, program, block).map(Some)
    }

    /// Current contents of every output variable and gradient slot.
    fn snapshot(&self, outputs: &ValueMap) -> Result<Vec<(SharedVar, Variable)>, FrameworkError> {
        let mut saved = Vec::new();
        for &id in outputs.values().flatten() {
            let value = self.value(id)?;
            for var in [value.var(), value.grad()] {
                let old = var.borrow().clone();
                saved.push((Rc::clone(var), old));
            }
        }
        Ok(saved)
    }

    /// Run a user-defined function on `inputs` and record it under slots
    /// `X` / `Out`. Returns the new output values.
    pub fn trace_custom(
        &mut self,
        func: Rc<dyn CustomFunction>,
        inputs: &[ValueId],
        stop_gradient: bool,
    ) -> Result<Vec<ValueId>, FrameworkError> {
        let op_type = func.name().to_string();
        debug!(op = %op_type, stop_gradient, "tracing custom function");

        let mut tensors = Vec::with_capacity(inputs.len());
        for &input in inputs {
            let value = self.value(input)?;
            if !value.is_initialized() {
                return Err(uninitialized_input(&op_type, value.name()));
            }
            tensors.push(value.var().borrow().get_tensor(value.name())?.clone());
        }
        let results = func.forward(&tensors)?;

        let id = OpId(self.ops.len());
        let first = self.values.len();
        let mut created: Vec<TrackedValue> = results
            .into_iter()
            .enumerate()
            .map(|(i, t)| {
                let var = Rc::new(RefCell::new(Variable::Tensor(t)));
                TrackedValue::new(format!("{op_type}_{}.out{i}", id.0), var)
            })
            .collect();
        for (index, value) in created.iter_mut().enumerate() {
            value.set_producer(ProducerLink {
                op: id,
                slot: CUSTOM_OUT.to_string(),
                index,
            })?;
            value.set_stop_gradient(stop_gradient);
        }
        let outputs: Vec<ValueId> = (first..first + created.len()).map(ValueId).collect();

        let input_names = self.names(inputs)?;
        let output_names: Vec<String> = created.iter().map(|v| v.name().to_string()).collect();
        let input_map = ValueMap::from([(CUSTOM_X.to_string(), inputs.to_vec())]);
        let output_map = ValueMap::from([(CUSTOM_OUT.to_string(), outputs.clone())]);
        let pre_ops = self.collect_pre_ops(&input_map)?;

        let backward = if stop_gradient {
            None
        } else {
            let out_grads = created
                .iter()
                .map(TrackedValue::ensure_grad_initialized)
                .collect::<Result<Vec<_>, FrameworkError>>()?;
            let mut grad_inputs = VarMap::new();
            grad_inputs.insert(CUSTOM_X.to_string(), self.vars_of(inputs)?);
            grad_inputs.insert(
                CUSTOM_OUT.to_string(),
                created.iter().map(|v| Rc::clone(v.var())).collect(),
            );
            grad_inputs.insert(CUSTOM_OUT_GRAD.to_string(), out_grads);
            let mut grad_outputs = VarMap::new();
            grad_outputs.insert(CUSTOM_X_GRAD.to_string(), self.grad_slots_of(inputs)?);

            let grad_names = |names: &[String]| -> Vec<String> {
                names.iter().map(|n| grad_var_name(n)).collect()
            };
            let grad_desc = OpDesc::new(format!("{op_type}_grad"))
                .with_input(CUSTOM_X, input_names.clone())
                .with_input(CUSTOM_OUT, output_names.clone())
                .with_input(CUSTOM_OUT_GRAD, grad_names(&output_names))
                .with_output(CUSTOM_X_GRAD, grad_names(&input_names));
            Some(GradBinding {
                desc: grad_desc,
                inputs: grad_inputs,
                outputs: grad_outputs,
            })
        };

        let mut op = Operation {
            id,
            desc: OpDesc::new(op_type)
                .with_input(CUSTOM_X, input_names)
                .with_output(CUSTOM_OUT, output_names),
            block: BlockId(0),
            inputs: input_map,
            outputs: output_map,
            pre_ops,
            grad_op_desc: None,
            grad_input_vars: VarMap::new(),
            grad_output_vars: VarMap::new(),
            backward: BackwardKind::None,
        };
        if let Some(binding) = backward {
            binding.attach(&mut op, BackwardKind::Custom(func));
        }
        self.values.extend(created);
        self.ops.push(op);
        Ok(outputs)
    }

    fn check_operands(
        &self,
        op_type: &str,
        inputs: &ValueMap,
        outputs: &ValueMap,
    ) -> Result<(), FrameworkError> {
        for &id in inputs.values().flatten() {
            let value = self.value(id)?;
            if !value.is_initialized() {
                return Err(uninitialized_input(op_type, value.name()));
            }
        }
        let mut seen = HashSet::new();
        for &id in outputs.values().flatten() {
            let value = self.value(id)?;
            if !seen.insert(id) {
                return Err(FrameworkError::InvalidOperand {
                    op_type: op_type.to_string(),
                    name: value.name().to_string(),
                    reason: "bound to more than one output".to_string(),
                });
            }
            if let Some(link) = value.producer() {
                return Err(FrameworkError::InvalidOperand {
                    op_type: op_type.to_string(),
                    name: value.name().to_string(),
                    reason: format!("already produced by op#{}", link.op.index()),
                });
            }
        }
        Ok(())
    }

    /// Make every operand visible in `block`; inputs also publish their
    /// current dims and dtype for inference.
    fn declare_operands(
        &self,
        inputs: &ValueMap,
        outputs: &ValueMap,
        program: &mut ProgramDesc,
        block: BlockId,
    ) -> Result<(), FrameworkError> {
        for &id in inputs.values().flatten() {
            let value = self.value(id)?;
            let desc = program.find_recursive_or_create_var(block, value.name())?;
            if let Some(tensor) = value.tensor() {
                desc.dims = tensor.dims().iter().copied().collect();
                desc.dtype = tensor.dtype();
            }
        }
        for &id in outputs.values().flatten() {
            program.find_recursive_or_create_var(block, self.value(id)?.name())?;
        }
        Ok(())
    }

    fn collect_pre_ops(
        &self,
        inputs: &ValueMap,
    ) -> Result<BTreeMap<String, Vec<Option<ProducerLink>>>, FrameworkError> {
        let mut pre_ops = BTreeMap::new();
        for (slot, ids) in inputs {
            let links = ids
                .iter()
                .map(|&id| Ok(self.value(id)?.producer().cloned()))
                .collect::<Result<Vec<_>, FrameworkError>>()?;
            pre_ops.insert(slot.clone(), links);
        }
        Ok(pre_ops)
    }

    /// Cannot fail once `check_operands` has passed: every output exists,
    /// appears once and has no producer yet.
    fn mark_outputs(
        &mut self,
        op: OpId,
        outputs: &ValueMap,
        program: &ProgramDesc,
        block: BlockId,
        stop_gradient: bool,
    ) -> Result<(), FrameworkError> {
        for (slot, ids) in outputs {
            for (index, &id) in ids.iter().enumerate() {
                let value = self.value_mut(id)?;
                let var_type = program
                    .find_var_recursive(block, value.name())
                    .map_or(VarType::DenseTensor, |d| d.var_type);
                if var_type != VarType::DenseTensor {
                    error!(var = value.name(), %var_type, "tracer does not support this output type yet");
                }
                value.set_producer(ProducerLink {
                    op,
                    slot: slot.clone(),
                    index,
                })?;
                value.set_stop_gradient(stop_gradient);
            }
        }
        Ok(())
    }

    fn record_output_shapes(
        &self,
        outputs: &ValueMap,
        program: &mut ProgramDesc,
        block: BlockId,
    ) -> Result<(), FrameworkError> {
        for &id in outputs.values().flatten() {
            let value = self.value(id)?;
            if let (Some(tensor), Some(desc)) =
                (value.tensor(), program.find_var_recursive_mut(block, value.name()))
            {
                desc.dims = tensor.dims().iter().copied().collect();
                desc.dtype = tensor.dtype();
            }
        }
        Ok(())
    }

    fn build_backward(
        &self,
        desc: &OpDesc,
        inputs: &ValueMap,
        outputs: &ValueMap,
        program: &mut ProgramDesc,
        block: BlockId,
    ) -> Result<GradBinding, FrameworkError> {
        let mut grad_to_var = GradToVar::new();
        let no_grad_set = HashSet::new();
        let mut descs =
            self.registry
                .grad_op_descs(desc, &no_grad_set, &[], program, &mut grad_to_var)?;
        let count = descs.len();
        let grad_desc = match descs.pop() {
            Some(grad) if count == 1 => grad,
            _ => {
                return Err(FrameworkError::UnsupportedGradient {
                    op_type: desc.op_type.clone(),
                    count,
                });
            }
        };

        let mut by_name: HashMap<String, ValueId> = HashMap::new();
        for &value in inputs.values().chain(outputs.values()).flatten() {
            by_name.insert(self.value(value)?.name().to_string(), value);
        }

        let mut grad_inputs = VarMap::new();
        for (slot, names) in &grad_desc.inputs {
            let vars = names
                .iter()
                .map(|name| {
                    if name == EMPTY_VAR_NAME {
                        return Ok(new_shared_var());
                    }
                    match by_name.get(name) {
                        Some(&value) => Ok(Rc::clone(self.value(value)?.var())),
                        None => self.grad_slot(name, &by_name, &grad_to_var),
                    }
                })
                .collect::<Result<Vec<_>, FrameworkError>>()?;
            grad_inputs.insert(slot.clone(), vars);
        }

        let mut grad_outputs = VarMap::new();
        for (slot, names) in &grad_desc.outputs {
            let vars = names
                .iter()
                .map(|name| {
                    if name == EMPTY_VAR_NAME {
                        Ok(new_shared_var())
                    } else {
                        self.grad_slot(name, &by_name, &grad_to_var)
                    }
                })
                .collect::<Result<Vec<_>, FrameworkError>>()?;
            grad_outputs.insert(slot.clone(), vars);
        }

        for name in grad_desc
            .input_arg_names()
            .chain(grad_desc.output_arg_names())
            .filter(|name| *name != EMPTY_VAR_NAME)
        {
            program.find_recursive_or_create_var(block, name)?;
        }
        trace!(op = %desc.op_type, grad_op = %grad_desc.op_type, "recorded backward op");
        Ok(GradBinding {
            desc: grad_desc,
            inputs: grad_inputs,
            outputs: grad_outputs,
        })
    }

    /// Gradient slot of the forward value `grad_to_var` maps `name` to,
    /// zero-initialized on first use.
    fn grad_slot(
        &self,
        name: &str,
        by_name: &HashMap<String, ValueId>,
        grad_to_var: &GradToVar,
    ) -> Result<SharedVar, FrameworkError> {
        let fwd = grad_to_var
            .get(name)
            .ok_or_else(|| FrameworkError::not_found(name))?;
        let value = by_name
            .get(fwd)
            .ok_or_else(|| FrameworkError::not_found(fwd.clone()))?;
        self.value(*value)?.ensure_grad_initialized()
    }

    fn bind(&self, map: &ValueMap) -> Result<VarMap, FrameworkError> {
        map.iter()
            .map(|(slot, ids)| Ok::<_, FrameworkError>((slot.clone(), self.vars_of(ids)?)))
            .collect()
    }

    fn vars_of(&self, ids: &[ValueId]) -> Result<Vec<SharedVar>, FrameworkError> {
        ids.iter()
            .map(|&id| Ok::<_, FrameworkError>(Rc::clone(self.value(id)?.var())))
            .collect()
    }

    fn grad_slots_of(&self, ids: &[ValueId]) -> Result<Vec<SharedVar>, FrameworkError> {
        ids.iter()
            .map(|&id| self.value(id)?.ensure_grad_initialized())
            .collect()
    }

    fn names(&self, ids: &[ValueId]) -> Result<Vec<String>, FrameworkError> {
        ids.iter()
            .map(|&id| Ok::<_, FrameworkError>(self.value(id)?.name().to_string()))
            .collect()
    }
}

/// Backward op of a traced call with its arguments bound to variables.
struct GradBinding {
    desc: OpDesc,
    inputs: VarMap,
    outputs: VarMap,
}

impl GradBinding {
    fn attach(self, op: &mut Operation, backward: BackwardKind) {
        op.grad_op_desc = Some(self.desc);
        op.grad_input_vars = self.inputs;
        op.grad_output_vars = self.outputs;
        op.backward = backward;
    }
}

fn unknown_handle(kind: &str, index: usize) -> FrameworkError {
    FrameworkError::InvalidOperand {
        op_type: "tracer".to_string(),
        name: format!("{kind}#{index}"),
        reason: "no such handle in this tracer".to_string(),
    }
}

fn uninitialized_input(op_type: &str, name: &str) -> FrameworkError {
    FrameworkError::InvalidOperand {
        op_type: op_type.to_string(),
        name: name.to_string(),
        reason: "input is not initialized".to_string(),
    }
}
