//! Define-by-run tracing and reverse-mode differentiation.
//!
//! ```text
//! TrackedValue ──input of──► Operation ──produces──► TrackedValue
//!      │                        │                         │
//!   grad slot            grad_op_desc + bound vars    producer link
//!      ▲                        │
//!      └──── engine::run_backward (reverse topological order) ◄─┘
//! ```
//!
//! # Key Types
//!
//! - [`Tracer`]: runs operators eagerly and records them
//! - [`TrackedValue`]: variable plus gradient slot and producer link
//! - [`Operation`]: one recorded call with its backward bindings
//! - [`CustomFunction`]: user-supplied forward/backward pair

mod custom;
pub mod engine;
mod operation;
mod tracer;
mod value;

pub use custom::CustomFunction;
pub use engine::run_backward;
pub use operation::{BackwardKind, OpId, Operation, ValueMap, VarMap};
pub use tracer::Tracer;
pub use value::{ProducerLink, TrackedValue, ValueId};
