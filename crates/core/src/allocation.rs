//! Scoped tensor construction defaults
//!
//! Model-construction code receives a [`TensorFactory`] and builds every
//! parameter through it. Activating an [`OnDevice`] scope on the factory
//! changes, for the lifetime of the returned guard:
//!
//! - the device of tensors built without an explicit device;
//! - the dtype of floating-point tensors.
//!
//! Scopes nest with stack discipline: dropping a guard restores the override
//! that was active when it was created, also while unwinding.
//!
//! ```ignore
//! let factory = TensorFactory::new();
//! {
//!     let _scope = factory.on_device(OnDevice::new(Device::Meta, DType::F16));
//!     let skeleton = builder.build(&factory)?; // no storage allocated
//! }
//! ```

use parking_lot::Mutex;

use crate::tensor::{DType, Device, Tensor};

/// Override applied while a scope is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnDevice {
    pub device: Device,
    pub dtype: DType,
    pub enabled: bool,
}

impl OnDevice {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self {
            device,
            dtype,
            enabled: true,
        }
    }

    /// Scope that changes nothing
    pub fn disabled(self) -> Self {
        Self {
            enabled: false,
            ..self
        }
    }
}

/// Tensor constructor with scoped overrides
#[derive(Debug)]
pub struct TensorFactory {
    default_device: Device,
    overrides: Mutex<Vec<OnDevice>>,
}

impl Default for TensorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorFactory {
    /// Factory placing tensors on the CPU by default
    pub fn new() -> Self {
        Self::with_default_device(Device::Cpu)
    }

    pub fn with_default_device(device: Device) -> Self {
        Self {
            default_device: device,
            overrides: Mutex::new(Vec::new()),
        }
    }

    /// Activate an override until the guard is dropped
    #[must_use = "the override ends when the guard is dropped"]
    pub fn on_device(&self, scope: OnDevice) -> AllocationScope<'_> {
        let depth = if scope.enabled {
            let mut stack = self.overrides.lock();
            stack.push(scope);
            Some(stack.len())
        } else {
            None
        };
        AllocationScope {
            factory: self,
            depth,
        }
    }

    /// The override currently in effect, if any
    pub fn active(&self) -> Option<OnDevice> {
        self.overrides.lock().last().copied()
    }

    fn resolve(&self, dtype: DType, device: Option<Device>) -> (DType, Device) {
        match self.active() {
            Some(scope) => {
                let dtype = if dtype.is_floating_point() {
                    scope.dtype
                } else {
                    dtype
                };
                (dtype, device.unwrap_or(scope.device))
            }
            None => (dtype, device.unwrap_or(self.default_device)),
        }
    }

    pub fn full(&self, shape: &[usize], value: f32, dtype: DType, device: Option<Device>) -> Tensor {
        let (dtype, device) = self.resolve(dtype, device);
        Tensor::full(shape.to_vec(), value, dtype, device)
    }

    pub fn zeros(&self, shape: &[usize], dtype: DType, device: Option<Device>) -> Tensor {
        self.full(shape, 0.0, dtype, device)
    }

    pub fn ones(&self, shape: &[usize], dtype: DType, device: Option<Device>) -> Tensor {
        self.full(shape, 1.0, dtype, device)
    }

    /// Uninitialized contents are zero-filled on the host mirror
    pub fn empty(&self, shape: &[usize], dtype: DType, device: Option<Device>) -> Tensor {
        self.full(shape, 0.0, dtype, device)
    }

    /// Tensor from explicit values; falls back to a meta tensor inside a meta scope
    pub fn from_values(
        &self,
        shape: &[usize],
        values: Vec<f32>,
        dtype: DType,
        device: Option<Device>,
    ) -> crate::error::Result<Tensor> {
        let (dtype, device) = self.resolve(dtype, device);
        Tensor::new(shape.to_vec(), dtype, device, values)
    }
}

/// Guard restoring the previous override on drop
#[derive(Debug)]
pub struct AllocationScope<'a> {
    factory: &'a TensorFactory,
    depth: Option<usize>,
}

impl Drop for AllocationScope<'_> {
    fn drop(&mut self) {
        if let Some(depth) = self.depth {
            let mut stack = self.factory.overrides.lock();
            // Also unwinds scopes leaked above this one
            stack.truncate(depth - 1);
        }
    }
}
