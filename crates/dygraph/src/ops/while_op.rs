//! Bounded `while` loop and its backprop-through-time gradient.
//!
//! ```text
//! while:       Init ─► [Condition true?] ─yes─► new step scope ─► run sub_block ─┐
//!                            ▲                                                    │
//!                            └────────────────────────────────────────────────────┘
//!                            no ─► Terminal (StepScopes = one scope per iteration)
//!
//! while_grad:  for step in StepScopes.rev():
//!                  link Out@GRAD (outer) ─► original_output_grad (inner)
//!                  run grad sub_block in step
//!                  X@GRAD += step-local X@GRAD      (zeroed on the first backward step)
//!                  wait(device); release(step) and drop it from StepScopes
//! ```

use crate::desc::{Attribute, BlockId, EMPTY_VAR_NAME, OpDesc, ProgramDesc, grad_var_name};
use crate::error::FrameworkError;
use crate::executor::Executor;
use crate::registry::GradOpMakerContext;
use crate::scope::{ScopeId, ScopeTree};
use crate::tensor::{DataType, DenseTensor};
use crate::variable::{SharedVar, Variable};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, trace};

pub const STEP_BLOCK: &str = "sub_block";
pub const CONDITION: &str = "Condition";
pub const STEP_SCOPES: &str = "StepScopes";
pub const X: &str = "X";
pub const X_GRAD: &str = "X@GRAD";
pub const OUTPUTS: &str = "Out";
pub const OUTPUTS_GRAD: &str = "Out@GRAD";
pub const ORIGINAL_OUTPUT_GRAD: &str = "original_output_grad";

fn single_arg<'o>(op: &'o OpDesc, names: &'o [String], slot: &str) -> Result<&'o str, FrameworkError> {
    match names {
        [name] => Ok(name),
        _ => Err(FrameworkError::InvalidOperand {
            op_type: op.op_type.clone(),
            name: slot.to_string(),
            reason: format!("expected exactly one argument, got {}", names.len()),
        }),
    }
}

fn find_or_create(
    scopes: &mut ScopeTree,
    scope: ScopeId,
    name: &str,
) -> Result<SharedVar, FrameworkError> {
    match scopes.find_var(scope, name) {
        Some(var) => Ok(var),
        None => scopes.var(scope, name),
    }
}

/// Value of the loop condition: a host-resident bool tensor with dims `[1]`.
pub(crate) fn read_condition(name: &str, var: &Variable) -> Result<bool, FrameworkError> {
    let cond = var.get_tensor(name)?;
    if cond.dims() != [1] {
        return Err(FrameworkError::shape_mismatch(name, [1usize], cond.dims()));
    }
    if !cond.place().is_host() {
        return Err(FrameworkError::UnsupportedDevice {
            name: name.to_string(),
            place: cond.place().to_string(),
        });
    }
    if cond.dtype() != DataType::Bool {
        return Err(FrameworkError::TypeMismatch {
            name: name.to_string(),
            expected: DataType::Bool.to_string(),
            actual: cond.dtype().to_string(),
        });
    }
    Ok(cond.as_bool()?[0])
}

/// Forward loop: one new step scope per iteration while `Condition` holds.
pub(crate) fn run_while(
    exec: &Executor<'_>,
    op: &OpDesc,
    program: &ProgramDesc,
    scopes: &mut ScopeTree,
    scope: ScopeId,
) -> Result<(), FrameworkError> {
    let cond_name = single_arg(op, op.input(CONDITION), CONDITION)?;
    let cond = scopes.require_var(scope, cond_name)?;
    let block = op.attr_block(STEP_BLOCK)?;
    let steps_name = single_arg(op, op.output(STEP_SCOPES), STEP_SCOPES)?;
    let steps = find_or_create(scopes, scope, steps_name)?;
    steps.borrow_mut().step_scopes_mut(steps_name)?;

    let mut step = 0usize;
    while read_condition(cond_name, &cond.borrow())? {
        let current = scopes.new_scope(scope)?;
        steps.borrow_mut().step_scopes_mut(steps_name)?.push(current);
        debug!(step, scope = current.index(), "while step");
        exec.run(program, scopes, current, block)?;
        step += 1;
    }
    debug!(steps = step, "while finished");
    Ok(())
}

/// Alias the outer output gradient into the step-local inner gradient.
///
/// Dense tensors share their buffer. Tensor lists are linked element by
/// element: a pre-declared inner list must have the outer list's length,
/// zero-size outer elements are skipped without a size check, and any other
/// element must match the dims of an already populated inner element.
pub(crate) fn link_output_grad(
    outer_name: &str,
    outer: &Variable,
    inner_name: &str,
    inner: &mut Variable,
) -> Result<(), FrameworkError> {
    match outer {
        Variable::Tensor(tensor) => {
            inner.set_tensor(tensor.clone());
            Ok(())
        }
        Variable::TensorList(outer_list) => {
            let inner_list = inner.tensor_list_mut(inner_name)?;
            if inner_list.is_empty() {
                inner_list.extend(
                    outer_list
                        .iter()
                        .map(|t| DenseTensor::zeros(&[0], t.dtype())),
                );
            } else if inner_list.len() != outer_list.len() {
                return Err(FrameworkError::shape_mismatch(
                    inner_name,
                    outer_list.len(),
                    inner_list.len(),
                ));
            }
            for (j, (src, dst)) in outer_list.iter().zip(inner_list.iter_mut()).enumerate() {
                trace!(outer = outer_name, index = j, numel = src.numel(), "linking list element");
                if src.numel() == 0 {
                    continue;
                }
                if dst.numel() != 0 && dst.dims() != src.dims() {
                    return Err(FrameworkError::shape_mismatch(
                        format!("{inner_name}[{j}]"),
                        src.dims(),
                        dst.dims(),
                    ));
                }
                dst.share_data_with(src);
            }
            Ok(())
        }
        Variable::Empty => {
            trace!(outer = outer_name, "outer gradient not initialized, nothing to link");
            Ok(())
        }
        Variable::StepScopes(_) => Err(FrameworkError::TypeMismatch {
            name: outer_name.to_string(),
            expected: "dense_tensor or tensor_list".to_string(),
            actual: "step_scopes".to_string(),
        }),
    }
}

fn accumulate(acc: &SharedVar, name: &str, grad: &DenseTensor) -> Result<(), FrameworkError> {
    let mut acc = acc.borrow_mut();
    match &mut *acc {
        Variable::Tensor(total) => total.add_assign(grad),
        other => Err(FrameworkError::TypeMismatch {
            name: name.to_string(),
            expected: "dense_tensor".to_string(),
            actual: other
                .var_type()
                .map_or_else(|| "uninitialized".to_string(), |t| t.to_string()),
        }),
    }
}

/// Backward loop over the recorded step scopes, newest first.
pub(crate) fn run_while_grad(
    exec: &Executor<'_>,
    op: &OpDesc,
    program: &ProgramDesc,
    scopes: &mut ScopeTree,
    scope: ScopeId,
) -> Result<(), FrameworkError> {
    let block = op.attr_block(STEP_BLOCK)?;
    let steps_name = single_arg(op, op.input(STEP_SCOPES), STEP_SCOPES)?;
    let steps_var = scopes.require_var(scope, steps_name)?;
    let steps: Vec<ScopeId> = steps_var.borrow().get_step_scopes(steps_name)?.to_vec();

    let outside_og = op.input(OUTPUTS_GRAD);
    let inside_og = op.attr_strings(ORIGINAL_OUTPUT_GRAD)?;
    if outside_og.len() != inside_og.len() {
        return Err(FrameworkError::shape_mismatch(
            ORIGINAL_OUTPUT_GRAD,
            outside_og.len(),
            inside_og.len(),
        ));
    }
    let params = op.input(X);
    let param_grads = op.output(X_GRAD);
    if params.len() != param_grads.len() {
        return Err(FrameworkError::shape_mismatch(X_GRAD, params.len(), param_grads.len()));
    }

    let config = exec.config();

    if steps.is_empty() {
        for (param, acc_name) in params.iter().zip(param_grads) {
            if acc_name == EMPTY_VAR_NAME {
                continue;
            }
            let param_var = scopes.require_var(scope, param)?;
            let zeros = DenseTensor::zeros_like(param_var.borrow().get_tensor(param)?);
            find_or_create(scopes, scope, acc_name)?
                .borrow_mut()
                .set_tensor(zeros);
        }
    }

    for (visit, &step) in steps.iter().rev().enumerate() {
        debug!(time_step = visit, scope = step.index(), "while_grad step");

        for (outer_name, inner_name) in outside_og.iter().zip(inside_og) {
            let outer = scopes.require_var(scope, outer_name)?;
            let inner = scopes.var(step, inner_name)?;
            link_output_grad(outer_name, &outer.borrow(), inner_name, &mut inner.borrow_mut())?;
        }

        exec.run(program, scopes, step, block)?;

        for (param, acc_name) in params.iter().zip(param_grads) {
            if acc_name == EMPTY_VAR_NAME {
                continue;
            }
            let inside_name = grad_var_name(param);
            let local = scopes
                .find_local_var(step, &inside_name)
                .ok_or_else(|| FrameworkError::not_found(inside_name.clone()))?;
            let local_grad = local.borrow().get_tensor(&inside_name)?.clone();

            let acc = find_or_create(scopes, scope, acc_name)?;
            if visit == 0 {
                acc.borrow_mut().set_tensor(DenseTensor::zeros_like(&local_grad));
            }
            accumulate(&acc, acc_name, &local_grad)?;
        }

        exec.dispatcher().wait(config.place)?;
        if config.release_step_scopes {
            scopes.delete_scope(step)?;
            steps_var
                .borrow_mut()
                .step_scopes_mut(steps_name)?
                .retain(|&s| s != step);
        }
    }
    Ok(())
}

/// Synthesize the `while_grad` descriptor from the backward sub-block.
pub(crate) fn while_grad_maker(
    ctx: &mut GradOpMakerContext<'_>,
) -> Result<Vec<OpDesc>, FrameworkError> {
    let program = ctx.program;
    let grad_block_id = ctx.grad_block(0)?;
    let grad_block = program.block(grad_block_id)?;
    let fwd_block = grad_block.forward_block.ok_or_else(|| FrameworkError::InvalidBlock {
        message: format!("grad block {} has no forward block", grad_block_id.0),
    })?;
    let parent_block = grad_block.parent.ok_or_else(|| FrameworkError::InvalidBlock {
        message: format!("grad block {} has no parent block", grad_block_id.0),
    })?;

    let params = ctx.input(X);
    let outputs = ctx.output(OUTPUTS);

    let inner_op_outputs: HashSet<&str> = grad_block
        .ops
        .iter()
        .flat_map(|op| op.output_arg_names())
        .collect();
    let input_grads: Vec<String> = ctx
        .input_grad(X, true)
        .into_iter()
        .map(|ig| {
            if inner_op_outputs.contains(ig.as_str()) {
                ig
            } else {
                trace!(grad = %ig, "input gradient not produced inside the loop");
                EMPTY_VAR_NAME.to_string()
            }
        })
        .collect();

    let mut block_ins: HashSet<&str> = params
        .iter()
        .chain(outputs.iter())
        .map(String::as_str)
        .collect();
    let mut output_grads: BTreeSet<String> = BTreeSet::new();
    for op in &grad_block.ops {
        for name in op.input_arg_names() {
            if name == EMPTY_VAR_NAME
                || block_ins.contains(name)
                || program.find_var_recursive(fwd_block, name).is_some()
                || program.find_var_recursive(parent_block, name).is_some()
            {
                continue;
            }
            output_grads.insert(name.to_string());
        }
        block_ins.extend(op.output_arg_names());
    }
    let output_grads: Vec<String> = output_grads.into_iter().collect();

    let mut grad = OpDesc::new("while_grad")
        .with_input(X, params)
        .with_input(OUTPUTS, outputs)
        .with_input(STEP_SCOPES, ctx.output(STEP_SCOPES))
        .with_input(OUTPUTS_GRAD, output_grads.clone())
        .with_output(X_GRAD, input_grads);
    for (name, value) in &ctx.fwd.attrs {
        grad.attrs.insert(name.clone(), value.clone());
    }
    grad.attrs
        .insert(STEP_BLOCK.to_string(), Attribute::Block(grad_block_id));
    grad.attrs.insert(
        ORIGINAL_OUTPUT_GRAD.to_string(),
        Attribute::Strings(output_grads),
    );
    Ok(vec![grad])
}

/// Every non-empty `X@GRAD[i]` follows `X[i]`'s var type and dtype.
pub(crate) fn infer_while_grad_var_type(
    op: &OpDesc,
    program: &mut ProgramDesc,
    block: BlockId,
) -> Result<(), FrameworkError> {
    for (param, grad) in op.input(X).iter().zip(op.output(X_GRAD)) {
        let param_desc = program
            .find_var_recursive(block, param)
            .cloned()
            .ok_or_else(|| FrameworkError::not_found(param.clone()))?;
        if let Some(grad_desc) = program.find_var_recursive_mut(block, grad) {
            trace!(grad = %grad, param = %param, var_type = %param_desc.var_type, "while_grad var type");
            grad_desc.var_type = param_desc.var_type;
            grad_desc.dtype = param_desc.dtype;
        }
    }
    Ok(())
}

/// Every non-empty `X@GRAD[i]` takes `X[i]`'s dims.
pub(crate) fn infer_while_grad_shape(
    op: &OpDesc,
    program: &mut ProgramDesc,
    block: BlockId,
) -> Result<(), FrameworkError> {
    for (param, grad) in op.input(X).iter().zip(op.output(X_GRAD)) {
        if grad == EMPTY_VAR_NAME {
            continue;
        }
        let dims = program
            .find_var_recursive(block, param)
            .map(|d| d.dims.clone())
            .ok_or_else(|| FrameworkError::not_found(param.clone()))?;
        program.find_recursive_or_create_var(block, grad)?.dims = dims;
    }
    Ok(())
}
