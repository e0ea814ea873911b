//! Runtime configuration shared by the tracer, executor and loop operators.

use crate::device::Place;

/// Knobs for tracing and block execution.
///
/// # Example
///
/// ```
/// use dygraph::{Place, RuntimeConfig};
///
/// let config = RuntimeConfig::default().with_release_step_scopes(false);
/// assert_eq!(config.place, Place::Cpu);
/// assert!(!config.release_step_scopes);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Place kernels are prepared for.
    pub place: Place,
    /// Whether `while_grad` deletes each step scope after processing it.
    pub release_step_scopes: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            place: Place::Cpu,
            release_step_scopes: true,
        }
    }
}

impl RuntimeConfig {
    /// Set the execution place.
    pub fn with_place(mut self, place: Place) -> Self {
        self.place = place;
        self
    }

    /// Keep or release step scopes after the backward loop visits them.
    pub fn with_release_step_scopes(mut self, release: bool) -> Self {
        self.release_step_scopes = release;
        self
    }
}
