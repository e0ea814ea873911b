//! User-defined forward/backward pairs.

use crate::error::FrameworkError;
use crate::tensor::DenseTensor;
use std::fmt::Debug;

/// An opaque differentiable function traced with
/// [`Tracer::trace_custom`](super::Tracer::trace_custom).
///
/// Inputs are bound to slot `X` and outputs to slot `Out`.
pub trait CustomFunction: Debug {
    /// Operator type recorded for the traced call.
    fn name(&self) -> &str {
        "custom"
    }

    fn forward(&self, inputs: &[DenseTensor]) -> Result<Vec<DenseTensor>, FrameworkError>;

    /// `inputs` holds the forward inputs, then the forward outputs, then one
    /// gradient per output. Returns one gradient per forward input.
    fn backward(&self, inputs: &[DenseTensor]) -> Result<Vec<DenseTensor>, FrameworkError>;
}
