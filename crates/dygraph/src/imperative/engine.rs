//! Backward pass over a traced graph.

use super::custom::CustomFunction;
use super::operation::{BackwardKind, OpId, Operation, VarMap};
use super::tracer::{CUSTOM_OUT, CUSTOM_OUT_GRAD, CUSTOM_X, CUSTOM_X_GRAD, Tracer};
use super::value::ValueId;
use crate::dispatch::RuntimeContext;
use crate::error::FrameworkError;
use crate::tensor::DenseTensor;
use crate::variable::{SharedVar, Variable, new_shared_var};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Propagate gradients from `root` to every value it depends on.
///
/// The root's gradient slot is set to `seed` (ones when `None`). Each
/// operation reachable through producer links then runs its backward op once,
/// after every operation that consumed its outputs. Results are added into
/// the gradient slots bound when the operation was traced.
///
/// # Errors
///
/// Returns `InvalidOperand` if `root` holds no tensor and `ShapeMismatch`
/// if `seed` does not match the root's dims.
pub fn run_backward(
    tracer: &Tracer<'_>,
    root: ValueId,
    seed: Option<DenseTensor>,
) -> Result<(), FrameworkError> {
    let value = tracer.value(root)?;
    let root_tensor = value.tensor().ok_or_else(|| FrameworkError::InvalidOperand {
        op_type: "backward".to_string(),
        name: value.name().to_string(),
        reason: "root value holds no tensor".to_string(),
    })?;
    let seed = match seed {
        Some(seed) if seed.dims() == root_tensor.dims() => seed,
        Some(seed) => {
            return Err(FrameworkError::shape_mismatch(
                value.grad_name(),
                root_tensor.dims(),
                seed.dims(),
            ));
        }
        None => DenseTensor::full(root_tensor.dims(), root_tensor.dtype(), 1.0),
    };
    value.grad().borrow_mut().set_tensor(seed);

    let Some(link) = value.producer() else {
        debug!(root = value.name(), "backward from a leaf value");
        return Ok(());
    };

    for id in backward_order(tracer, link.op)? {
        let op = tracer.op(id)?;
        trace!(op = %op.desc().op_type, id = id.index(), backward = ?op.backward(), "backward step");
        match op.backward() {
            BackwardKind::None => {}
            BackwardKind::Registry => run_registry_grad(tracer, op)?,
            BackwardKind::Custom(func) => run_custom_grad(func.as_ref(), op)?,
        }
    }
    Ok(())
}

/// Operations reachable from `start`, consumers before producers.
fn backward_order(tracer: &Tracer<'_>, start: OpId) -> Result<Vec<OpId>, FrameworkError> {
    let mut graph: DiGraph<OpId, ()> = DiGraph::new();
    let mut index: HashMap<OpId, NodeIndex> = HashMap::new();
    let mut stack = vec![start];
    index.insert(start, graph.add_node(start));

    while let Some(id) = stack.pop() {
        let consumer = index[&id];
        for pred in tracer.op(id)?.predecessors() {
            let producer = match index.get(&pred) {
                Some(&node) => node,
                None => {
                    let node = graph.add_node(pred);
                    index.insert(pred, node);
                    stack.push(pred);
                    node
                }
            };
            graph.update_edge(producer, consumer, ());
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| FrameworkError::InvalidBlock {
        message: format!("traced graph has a cycle through op#{}", graph[cycle.node_id()].index()),
    })?;
    Ok(order.into_iter().rev().map(|node| graph[node]).collect())
}

fn run_registry_grad(tracer: &Tracer<'_>, op: &Operation) -> Result<(), FrameworkError> {
    let Some(grad_desc) = op.grad_op_desc() else {
        return Ok(());
    };
    let instance = tracer.registry().create_op(grad_desc)?;

    // Kernels write into fresh variables; the results are then added into
    // the accumulators so values consumed more than once sum their grads.
    let temps: VarMap = op
        .grad_output_vars()
        .iter()
        .map(|(slot, vars)| (slot.clone(), vars.iter().map(|_| new_shared_var()).collect()))
        .collect();
    let ctx = RuntimeContext::new(op.grad_input_vars().clone(), temps.clone());
    tracer
        .dispatcher()
        .prepare(&instance, ctx, tracer.config().place)?
        .run()?;

    for (slot, accs) in op.grad_output_vars() {
        let Some(produced) = temps.get(slot) else {
            continue;
        };
        for (acc, tmp) in accs.iter().zip(produced) {
            accumulate(acc, slot, &tmp.borrow())?;
        }
    }
    Ok(())
}

fn run_custom_grad(func: &dyn CustomFunction, op: &Operation) -> Result<(), FrameworkError> {
    let mut inputs = Vec::new();
    for slot in [CUSTOM_X, CUSTOM_OUT, CUSTOM_OUT_GRAD] {
        for var in op.grad_input_vars().get(slot).map(Vec::as_slice).unwrap_or(&[]) {
            inputs.push(var.borrow().get_tensor(slot)?.clone());
        }
    }
    let grads = func.backward(&inputs)?;

    let targets = op
        .grad_output_vars()
        .get(CUSTOM_X_GRAD)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    if grads.len() != targets.len() {
        return Err(FrameworkError::InvalidOperand {
            op_type: func.name().to_string(),
            name: CUSTOM_X_GRAD.to_string(),
            reason: format!(
                "backward returned {} gradients for {} inputs",
                grads.len(),
                targets.len()
            ),
        });
    }
    for (acc, grad) in targets.iter().zip(grads) {
        accumulate(acc, CUSTOM_X_GRAD, &Variable::Tensor(grad))?;
    }
    Ok(())
}

fn describe(var: &Variable) -> String {
    var.var_type()
        .map_or_else(|| "uninitialized".to_string(), |t| t.to_string())
}

/// `acc += grad`. An uninitialized `grad` is a no-op; an uninitialized
/// `acc` takes `grad` as is.
pub(crate) fn accumulate(acc: &SharedVar, name: &str, grad: &Variable) -> Result<(), FrameworkError> {
    if !grad.is_initialized() {
        return Ok(());
    }
    let mut acc = acc.borrow_mut();
    if !acc.is_initialized() {
        *acc = grad.clone();
        return Ok(());
    }
    match (&mut *acc, grad) {
        (Variable::Tensor(total), Variable::Tensor(g)) => total.add_assign(g),
        (Variable::TensorList(totals), Variable::TensorList(gs)) => {
            if totals.len() != gs.len() {
                return Err(FrameworkError::shape_mismatch(name, totals.len(), gs.len()));
            }
            for (total, g) in totals.iter_mut().zip(gs) {
                total.add_assign(g)?;
            }
            Ok(())
        }
        (total, g) => Err(FrameworkError::TypeMismatch {
            name: name.to_string(),
            expected: describe(total),
            actual: describe(g),
        }),
    }
}
