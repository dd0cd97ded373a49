#![deny(warnings)]
#![deny(missing_docs)]
#![warn(clippy::all)]

//! CudaWorker manages host/device buffer pairs on a compute device and dispatches kernels over them.
//!
//! A [`DeviceContext`] wraps one [`Backend`] and spawns [`Worker`]s. Each worker owns an
//! index-addressed set of host/device buffer pairs of one uniform size, copies data between
//! them and launches kernels over a [`LaunchDim`] configuration.

pub mod backend;
mod context;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod emulated;
mod error;
mod idmap;
mod launch;
pub mod utils;
mod worker;

pub use crate::backend::{Backend, DeviceLimits, DevicePtr, KernelArgument};
pub use crate::context::{DeviceContext, WorkerId, WorkerStatus};
pub use crate::error::{Error, Result, Side};
pub use crate::launch::LaunchHandle;
pub use crate::worker::{DeviceBuffer, HostBuffer, Worker, WorkerInfo};

use std::fmt;

/// Dimension configuration of a kernel dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchDim {
    /// Number of blocks in the grid.
    pub grid: u32,
    /// Number of threads per block.
    pub block: u32,
    /// Dynamic shared memory per block, in bytes.
    pub shared_mem: u32,
}

impl LaunchDim {
    /// Create LaunchDim without shared memory
    pub fn new(grid: u32, block: u32) -> Self {
        LaunchDim {
            grid,
            block,
            shared_mem: 0,
        }
    }

    /// Set dynamic shared memory per block.
    pub fn with_shared_mem(mut self, shared_mem: u32) -> Self {
        self.shared_mem = shared_mem;
        self
    }

    /// Total number of threads, grid * block.
    pub fn threads(&self) -> u64 {
        self.grid as u64 * self.block as u64
    }
}

impl fmt::Display for LaunchDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<<<{}, {}, {}>>>",
            self.grid, self.block, self.shared_mem
        )
    }
}

/// Identifier of a kernel function registered in a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub usize);

/// Argument of a KernelDescriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    /// Device buffer of the worker's buffer pair at this index
    Buffer(usize),
    /// Plain value passed by value
    Scalar(u64),
}

/// A kernel function together with its argument bindings.
///
/// Buffer arguments name buffer pair indices; they are resolved to device pointers by the
/// worker at launch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDescriptor {
    function: FunctionId,
    args: Vec<KernelArg>,
}

impl KernelDescriptor {
    /// Create KernelDescriptor without arguments
    pub fn new(function: FunctionId) -> Self {
        KernelDescriptor {
            function,
            args: vec![],
        }
    }

    /// Append the device buffer at `index` as next argument.
    pub fn buffer(mut self, index: usize) -> Self {
        self.args.push(KernelArg::Buffer(index));
        self
    }

    /// Append a scalar as next argument.
    pub fn scalar(mut self, value: u64) -> Self {
        self.args.push(KernelArg::Scalar(value));
        self
    }

    /// Kernel function
    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// Bound arguments in call order
    pub fn args(&self) -> &[KernelArg] {
        &self.args
    }

    /// Buffer indices referenced by this kernel, in argument order.
    pub fn buffer_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.args.iter().filter_map(|arg| match arg {
            KernelArg::Buffer(index) => Some(*index),
            KernelArg::Scalar(_) => None,
        })
    }
}
