//! Contract between workers and the device that actually holds memory and runs kernels.

use crate::{FunctionId, LaunchDim, Result};
use std::fmt;

/// Opaque address of a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Kernel argument after buffer indices were resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArgument {
    /// Device Pointer
    Pointer(DevicePtr),
    /// Other type of arguments
    Other(u64),
}

/// Dispatch limits of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum threads in one block
    pub max_threads_per_block: u32,
    /// Maximum dynamic shared memory per block in bytes
    pub max_shared_memory: u32,
}

impl DeviceLimits {
    /// Check a dispatch configuration against these limits.
    pub fn validate(&self, dim: &LaunchDim) -> Result<(), String> {
        if dim.grid == 0 || dim.block == 0 {
            return Err(format!("empty dimension {}", dim));
        }
        if dim.block > self.max_threads_per_block {
            return Err(format!(
                "block size {} exceeds device limit {}",
                dim.block, self.max_threads_per_block
            ));
        }
        if dim.shared_mem > self.max_shared_memory {
            return Err(format!(
                "shared memory {} exceeds device limit {}",
                dim.shared_mem, self.max_shared_memory
            ));
        }
        Ok(())
    }
}

/// A compute device as seen by workers.
///
/// Implementations must be usable from executor threads, asynchronous launches call
/// [`Backend::launch`] off the worker's thread.
pub trait Backend: Send + Sync {
    /// Human readable device name.
    fn name(&self) -> String;

    /// Dispatch limits of the device.
    fn limits(&self) -> DeviceLimits;

    /// Reserve `size` bytes of device memory.
    fn allocate(&self, size: usize) -> Result<DevicePtr>;

    /// Give back memory obtained from `allocate`.
    fn release(&self, ptr: DevicePtr);

    /// Copy `source` to the start of the allocation at `ptr`.
    fn copy_to_device(&self, ptr: DevicePtr, source: &[u8]) -> Result<()>;

    /// Fill `dest` from the start of the allocation at `ptr`.
    fn copy_to_host(&self, dest: &mut [u8], ptr: DevicePtr) -> Result<()>;

    /// Run `function` over `dim` and return once it has completed.
    fn launch(&self, function: FunctionId, args: &[KernelArgument], dim: &LaunchDim)
        -> Result<()>;
}
