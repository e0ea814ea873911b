//! Integration tests for the `while` loop and its backprop-through-time
//! gradient.

use approx::assert_relative_eq;
use dygraph::ops::while_op::{
    CONDITION, ORIGINAL_OUTPUT_GRAD, OUTPUTS, OUTPUTS_GRAD, STEP_BLOCK, STEP_SCOPES, X, X_GRAD,
};
use dygraph::{
    Attribute, BlockId, DenseTensor, DeviceContext, DeviceContextPool, Executor, FrameworkError,
    KernelDispatcher, OpDesc, OpInfo, OpRegistry, Place, ProgramDesc, RuntimeConfig, ScopeId,
    ScopeTree, VarDesc,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Forward body: `y = 2w; snap = i; i += 1; cond = i < n`.
/// Gradient body: `record(snap); w@GRAD = 2 * y@GRAD`.
struct LoopProgram {
    program: ProgramDesc,
    body: BlockId,
    grad: BlockId,
}

fn loop_program() -> LoopProgram {
    let mut program = ProgramDesc::new();
    let global = program.global_block();
    for name in ["w", "y", "i", "n", "cond"] {
        program
            .block_mut(global)
            .unwrap()
            .add_var(VarDesc::new(name).with_dims(&[1]));
    }

    let body = program.append_block(global).unwrap();
    {
        let block = program.block_mut(body).unwrap();
        block.add_var(VarDesc::new("snap"));
        block.append_op(
            OpDesc::new("scale")
                .with_input("X", ["w"])
                .with_output("Out", ["y"])
                .with_attr("scale", Attribute::Float(2.0)),
        );
        block.append_op(OpDesc::new("assign").with_input("X", ["i"]).with_output("Out", ["snap"]));
        block.append_op(OpDesc::new("increment").with_input("X", ["i"]).with_output("Out", ["i"]));
        block.append_op(
            OpDesc::new("less_than")
                .with_input("X", ["i"])
                .with_input("Y", ["n"])
                .with_output("Out", ["cond"]),
        );
    }

    let grad = program.append_grad_block(global, body).unwrap();
    {
        let block = program.block_mut(grad).unwrap();
        block.add_var(VarDesc::new("w@GRAD"));
        block.append_op(OpDesc::new("record_step").with_input("X", ["snap"]));
        block.append_op(
            OpDesc::new("scale")
                .with_input("X", ["y@GRAD"])
                .with_output("Out", ["w@GRAD"])
                .with_attr("scale", Attribute::Float(2.0)),
        );
    }

    LoopProgram {
        program,
        body,
        grad,
    }
}

fn while_desc(body: BlockId) -> OpDesc {
    OpDesc::new("while")
        .with_input(X, ["w"])
        .with_input(CONDITION, ["cond"])
        .with_output(OUTPUTS, ["y"])
        .with_output(STEP_SCOPES, ["steps"])
        .with_attr(STEP_BLOCK, Attribute::Block(body))
}

fn registry_with_recorder(seen: Arc<Mutex<Vec<i64>>>) -> OpRegistry {
    let mut registry = OpRegistry::with_builtin_ops();
    registry.register(
        "record_step",
        OpInfo::kernel(move |ctx| {
            let snap = ctx.input_tensor("X")?;
            seen.lock().unwrap().push(snap.as_i64()?[0]);
            Ok(())
        }),
    );
    registry
}

fn set(scopes: &mut ScopeTree, name: &str, tensor: DenseTensor) {
    let root = scopes.root();
    scopes.var(root, name).unwrap().borrow_mut().set_tensor(tensor);
}

fn seeded_scopes(iterations: i64) -> ScopeTree {
    let mut scopes = ScopeTree::new();
    set(&mut scopes, "w", DenseTensor::scalar_f32(1.0));
    set(&mut scopes, "i", DenseTensor::from_i64(vec![0], &[1]).unwrap());
    set(&mut scopes, "n", DenseTensor::from_i64(vec![iterations], &[1]).unwrap());
    set(&mut scopes, "cond", DenseTensor::scalar_bool(iterations > 0));
    let root = scopes.root();
    scopes.var(root, "y").unwrap();
    scopes
}

fn step_scopes(scopes: &ScopeTree) -> Vec<ScopeId> {
    let root = scopes.root();
    let var = scopes.find_var(root, "steps").unwrap();
    let steps = var.borrow().get_step_scopes("steps").unwrap().to_vec();
    steps
}

fn grad_desc(registry: &OpRegistry, program: &ProgramDesc, body: BlockId, grad: BlockId) -> OpDesc {
    let mut grad_to_var = Default::default();
    let mut descs = registry
        .grad_op_descs(&while_desc(body), &HashSet::new(), &[grad], program, &mut grad_to_var)
        .unwrap();
    assert_eq!(descs.len(), 1);
    descs.pop().unwrap()
}

fn accumulator(scopes: &ScopeTree) -> f32 {
    let root = scopes.root();
    let var = scopes.find_var(root, "w@GRAD").unwrap();
    let value = var.borrow().get_tensor("w@GRAD").unwrap().as_f32().unwrap()[0];
    value
}

#[test]
fn test_three_iterations_accumulate_gradient() {
    init_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = registry_with_recorder(Arc::clone(&seen));
    let dispatcher = KernelDispatcher::default();
    let config = RuntimeConfig::default();
    let executor = Executor::new(&registry, &dispatcher, &config);

    let LoopProgram { program, body, grad } = loop_program();
    let mut scopes = seeded_scopes(3);
    let root = scopes.root();

    executor
        .run_op(&while_desc(body), &program, &mut scopes, root)
        .unwrap();
    let steps = step_scopes(&scopes);
    assert_eq!(steps.len(), 3);
    assert_eq!(scopes.kids(root).unwrap(), steps.as_slice());
    let i = scopes.find_var(root, "i").unwrap();
    assert_eq!(i.borrow().tensor().unwrap().as_i64().unwrap(), &[3]);
    for (n, &step) in steps.iter().enumerate() {
        let snap = scopes.find_local_var(step, "snap").unwrap();
        assert_eq!(snap.borrow().tensor().unwrap().as_i64().unwrap(), &[n as i64]);
    }

    set(&mut scopes, "y@GRAD", DenseTensor::scalar_f32(1.0));
    let backward = grad_desc(&registry, &program, body, grad);
    executor
        .run_op(&backward, &program, &mut scopes, root)
        .unwrap();

    assert_relative_eq!(accumulator(&scopes), 6.0);
    assert_eq!(*seen.lock().unwrap(), vec![2, 1, 0]);
    assert_eq!(scopes.len(), 1);
    assert!(step_scopes(&scopes).is_empty());
}

#[test]
fn test_step_scopes_kept_when_release_disabled() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = registry_with_recorder(seen);
    let dispatcher = KernelDispatcher::default();
    let config = RuntimeConfig::default().with_release_step_scopes(false);
    let executor = Executor::new(&registry, &dispatcher, &config);

    let LoopProgram { program, body, grad } = loop_program();
    let mut scopes = seeded_scopes(2);
    let root = scopes.root();
    executor
        .run_op(&while_desc(body), &program, &mut scopes, root)
        .unwrap();
    set(&mut scopes, "y@GRAD", DenseTensor::scalar_f32(0.5));
    executor
        .run_op(&grad_desc(&registry, &program, body, grad), &program, &mut scopes, root)
        .unwrap();

    assert_relative_eq!(accumulator(&scopes), 2.0);
    let steps = step_scopes(&scopes);
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|&s| scopes.is_alive(s)));
}

#[test]
fn test_zero_iterations_leave_zero_gradient() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = registry_with_recorder(Arc::clone(&seen));
    let dispatcher = KernelDispatcher::default();
    let config = RuntimeConfig::default();
    let executor = Executor::new(&registry, &dispatcher, &config);

    let LoopProgram { program, body, grad } = loop_program();
    let mut scopes = seeded_scopes(0);
    let root = scopes.root();
    executor
        .run_op(&while_desc(body), &program, &mut scopes, root)
        .unwrap();
    assert!(step_scopes(&scopes).is_empty());
    assert_eq!(scopes.len(), 1);

    set(&mut scopes, "y@GRAD", DenseTensor::scalar_f32(1.0));
    executor
        .run_op(&grad_desc(&registry, &program, body, grad), &program, &mut scopes, root)
        .unwrap();
    assert_eq!(accumulator(&scopes), 0.0);
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_while_grad_descriptor() {
    let registry = OpRegistry::with_builtin_ops();
    let LoopProgram { program, body, grad } = loop_program();
    let desc = grad_desc(&registry, &program, body, grad);

    assert_eq!(desc.op_type, "while_grad");
    assert_eq!(desc.input(X), &["w".to_string()]);
    assert_eq!(desc.input(OUTPUTS), &["y".to_string()]);
    assert_eq!(desc.input(STEP_SCOPES), &["steps".to_string()]);
    assert_eq!(desc.input(OUTPUTS_GRAD), &["y@GRAD".to_string()]);
    assert_eq!(desc.output(X_GRAD), &["w@GRAD".to_string()]);
    assert_eq!(
        desc.attr_strings(ORIGINAL_OUTPUT_GRAD).unwrap(),
        &["y@GRAD".to_string()]
    );
    assert_eq!(desc.attr_block(STEP_BLOCK).unwrap(), grad);
}

#[test]
fn test_condition_on_accelerator_rejected() {
    let registry = OpRegistry::with_builtin_ops();
    let dispatcher = KernelDispatcher::default();
    let config = RuntimeConfig::default();
    let executor = Executor::new(&registry, &dispatcher, &config);

    let LoopProgram { program, body, .. } = loop_program();
    let mut scopes = seeded_scopes(1);
    set(
        &mut scopes,
        "cond",
        DenseTensor::scalar_bool(true).with_place(Place::Accelerator(0)),
    );
    let root = scopes.root();
    let result = executor.run_op(&while_desc(body), &program, &mut scopes, root);
    assert!(matches!(result, Err(FrameworkError::UnsupportedDevice { .. })));
}

#[test]
fn test_condition_wrong_shape_rejected() {
    let registry = OpRegistry::with_builtin_ops();
    let dispatcher = KernelDispatcher::default();
    let config = RuntimeConfig::default();
    let executor = Executor::new(&registry, &dispatcher, &config);

    let LoopProgram { program, body, .. } = loop_program();
    let mut scopes = seeded_scopes(1);
    set(
        &mut scopes,
        "cond",
        DenseTensor::from_bool(vec![true, false], &[2]).unwrap(),
    );
    let root = scopes.root();
    let result = executor.run_op(&while_desc(body), &program, &mut scopes, root);
    assert!(matches!(result, Err(FrameworkError::ShapeMismatch { .. })));
}

#[test]
fn test_while_grad_requires_matching_output_grad_lists() {
    let registry = OpRegistry::with_builtin_ops();
    let dispatcher = KernelDispatcher::default();
    let config = RuntimeConfig::default();
    let executor = Executor::new(&registry, &dispatcher, &config);

    let LoopProgram { program, grad, .. } = loop_program();
    let mut scopes = ScopeTree::new();
    let root = scopes.root();
    scopes
        .var(root, "steps")
        .unwrap()
        .borrow_mut()
        .step_scopes_mut("steps")
        .unwrap();

    let desc = OpDesc::new("while_grad")
        .with_input(STEP_SCOPES, ["steps"])
        .with_input(OUTPUTS_GRAD, ["y@GRAD", "z@GRAD"])
        .with_attr(STEP_BLOCK, Attribute::Block(grad))
        .with_attr(ORIGINAL_OUTPUT_GRAD, Attribute::Strings(vec!["y@GRAD".to_string()]));
    let result = executor.run_op(&desc, &program, &mut scopes, root);
    assert!(matches!(result, Err(FrameworkError::ShapeMismatch { .. })));
}

#[test]
fn test_failed_grad_step_keeps_step_scopes_consistent() {
    let mut registry = OpRegistry::with_builtin_ops();
    registry.register(
        "record_step",
        OpInfo::kernel(|ctx| {
            let snap = ctx.input_tensor("X")?;
            if snap.as_i64()?[0] == 0 {
                return Err(FrameworkError::InvalidBlock {
                    message: "first step cannot be replayed".to_string(),
                });
            }
            Ok(())
        }),
    );
    let dispatcher = KernelDispatcher::default();
    let config = RuntimeConfig::default();
    let executor = Executor::new(&registry, &dispatcher, &config);

    let LoopProgram { program, body, grad } = loop_program();
    let mut scopes = seeded_scopes(2);
    let root = scopes.root();
    executor
        .run_op(&while_desc(body), &program, &mut scopes, root)
        .unwrap();
    let recorded = step_scopes(&scopes);
    assert_eq!(recorded.len(), 2);

    set(&mut scopes, "y@GRAD", DenseTensor::scalar_f32(1.0));
    let backward = grad_desc(&registry, &program, body, grad);
    let result = executor.run_op(&backward, &program, &mut scopes, root);
    assert!(matches!(result, Err(FrameworkError::InvalidBlock { .. })));

    // The newest step was released and dropped; the failing one remains.
    let remaining = step_scopes(&scopes);
    assert_eq!(remaining, vec![recorded[0]]);
    assert!(remaining.iter().all(|&s| scopes.is_alive(s)));
    assert!(!scopes.is_alive(recorded[1]));
}

#[derive(Debug, Default)]
struct CountingContext {
    waits: AtomicUsize,
}

impl DeviceContext for CountingContext {
    fn place(&self) -> Place {
        Place::Cpu
    }

    fn wait(&self) {
        self.waits.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_while_grad_waits_on_device_once_per_step() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = registry_with_recorder(seen);
    let device = Arc::new(CountingContext::default());
    let mut pool = DeviceContextPool::new();
    pool.insert(Arc::clone(&device) as Arc<dyn DeviceContext>);
    let dispatcher = KernelDispatcher::new(pool);
    let config = RuntimeConfig::default();
    let executor = Executor::new(&registry, &dispatcher, &config);

    let LoopProgram { program, body, grad } = loop_program();
    let mut scopes = seeded_scopes(3);
    let root = scopes.root();
    executor
        .run_op(&while_desc(body), &program, &mut scopes, root)
        .unwrap();
    assert_eq!(device.waits.load(Ordering::SeqCst), 0);

    set(&mut scopes, "y@GRAD", DenseTensor::scalar_f32(1.0));
    executor
        .run_op(&grad_desc(&registry, &program, body, grad), &program, &mut scopes, root)
        .unwrap();
    assert_eq!(device.waits.load(Ordering::SeqCst), 3);
}
