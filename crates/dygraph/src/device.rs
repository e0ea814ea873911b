//! Execution places and the device-context pool.

use crate::error::FrameworkError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Where a tensor's memory lives and where kernels run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Place {
    /// Host memory, directly addressable by the runtime.
    #[default]
    Cpu,
    /// An accelerator identified by ordinal.
    Accelerator(u32),
}

impl Place {
    /// Whether memory at this place can be read directly by the host.
    #[inline]
    pub fn is_host(&self) -> bool {
        matches!(self, Place::Cpu)
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Cpu => write!(f, "cpu"),
            Place::Accelerator(id) => write!(f, "accelerator:{id}"),
        }
    }
}

/// Per-place execution context.
///
/// Kernels may run asynchronously with respect to the host; `wait` blocks
/// until all work queued on this context has completed.
pub trait DeviceContext: fmt::Debug + Send + Sync {
    /// Place served by this context.
    fn place(&self) -> Place;

    /// Block until every queued kernel has finished.
    fn wait(&self);
}

/// Host context. Kernels complete synchronously, so `wait` returns at once.
#[derive(Debug, Default)]
pub struct CpuDeviceContext;

impl DeviceContext for CpuDeviceContext {
    fn place(&self) -> Place {
        Place::Cpu
    }

    fn wait(&self) {}
}

/// Pool of device contexts keyed by place.
#[derive(Debug, Clone)]
pub struct DeviceContextPool {
    contexts: HashMap<Place, Arc<dyn DeviceContext>>,
}

impl DeviceContextPool {
    /// Pool containing only the host context.
    pub fn new() -> Self {
        let mut contexts: HashMap<Place, Arc<dyn DeviceContext>> = HashMap::new();
        contexts.insert(Place::Cpu, Arc::new(CpuDeviceContext));
        Self { contexts }
    }

    /// Register (or replace) the context serving `ctx.place()`.
    pub fn insert(&mut self, ctx: Arc<dyn DeviceContext>) {
        self.contexts.insert(ctx.place(), ctx);
    }

    /// Context for `place`.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedDevice` if no context serves `place`.
    pub fn get(&self, place: Place) -> Result<Arc<dyn DeviceContext>, FrameworkError> {
        self.contexts
            .get(&place)
            .cloned()
            .ok_or_else(|| FrameworkError::UnsupportedDevice {
                name: "device context".to_string(),
                place: place.to_string(),
            })
    }
}

impl Default for DeviceContextPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_display() {
        assert_eq!(Place::Cpu.to_string(), "cpu");
        assert_eq!(Place::Accelerator(2).to_string(), "accelerator:2");
        assert!(Place::Cpu.is_host());
        assert!(!Place::Accelerator(0).is_host());
    }

    #[test]
    fn test_pool_missing_place() {
        let pool = DeviceContextPool::new();
        assert!(pool.get(Place::Cpu).is_ok());
        assert!(matches!(
            pool.get(Place::Accelerator(0)),
            Err(FrameworkError::UnsupportedDevice { .. })
        ));
    }
}
