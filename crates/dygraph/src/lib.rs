//! dygraph - define-by-run autodiff tracer with a bounded loop operator
//!
//! Forward operators run eagerly through a kernel dispatcher while the tracer
//! records the graph needed for reverse-mode differentiation. Static blocks
//! (used by the `while` operator) run through a scope-based executor, and the
//! loop's gradient replays its iterations backward through time.
//!
//! # Architecture
//!
//! ```text
//! Tracer::trace ──► OpRegistry (infer, create_op, grad maker)
//!      │                  │
//!      ▼                  ▼
//! KernelDispatcher ◄── Executor::run(block, scope)
//!      │                  │
//!      ▼                  ▼
//!   KernelFn       while / while_grad ──► ScopeTree (one scope per step)
//! ```
//!
//! # Example
//!
//! ```
//! use dygraph::{DenseTensor, OpDesc, OpRegistry, ProgramDesc, Tracer};
//! use std::collections::BTreeMap;
//!
//! let registry = OpRegistry::with_builtin_ops();
//! let mut tracer = Tracer::new(&registry);
//! let mut program = ProgramDesc::new();
//! let block = program.global_block();
//!
//! let x = tracer.create_value("x", DenseTensor::from_f32(vec![1.0, 2.0], &[2]).unwrap());
//! let y = tracer.create_output("y");
//! let op = OpDesc::new("elementwise_mul")
//!     .with_input("X", ["x"])
//!     .with_input("Y", ["x"])
//!     .with_output("Out", ["y"]);
//! tracer
//!     .trace(
//!         &op,
//!         &BTreeMap::from([("X".to_string(), vec![x]), ("Y".to_string(), vec![x])]),
//!         &BTreeMap::from([("Out".to_string(), vec![y])]),
//!         &mut program,
//!         block,
//!         false,
//!     )
//!     .unwrap();
//!
//! tracer.backward(y, None).unwrap();
//! let grad = tracer.value(x).unwrap().grad_tensor().unwrap();
//! assert_eq!(grad.as_f32().unwrap(), &[2.0, 4.0]);
//! ```

pub mod config;
pub mod desc;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod imperative;
pub mod ops;
pub mod registry;
pub mod scope;
pub mod tensor;
pub mod variable;

pub use config::RuntimeConfig;
pub use desc::{
    Attribute, BlockDesc, BlockId, EMPTY_VAR_NAME, GRAD_SUFFIX, OpDesc, ProgramDesc, VarDesc,
    grad_var_name,
};
pub use device::{CpuDeviceContext, DeviceContext, DeviceContextPool, Place};
pub use dispatch::{ExecutionContext, KernelDispatcher, PreparedOp, RuntimeContext};
pub use error::FrameworkError;
pub use executor::Executor;
pub use imperative::{CustomFunction, OpId, TrackedValue, Tracer, ValueId};
pub use registry::{GradOpMakerContext, OpInfo, OpKind, OpRegistry, OperatorInstance};
pub use scope::{ScopeId, ScopeTree};
pub use tensor::{DataType, DenseTensor, Dims};
pub use variable::{SharedVar, VarType, Variable};

/// Result type for every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, FrameworkError>;
