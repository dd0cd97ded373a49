//! Errors reported by workers and backends.

use crate::context::WorkerId;
use std::fmt;

/// Which half of a buffer pair an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Host resident buffer
    Host,
    /// Device resident buffer
    Device,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Host => write!(f, "host"),
            Side::Device => write!(f, "device"),
        }
    }
}

/// Errors during worker and backend calls.
///
/// Nothing is retried internally, every failure is reported to the immediate caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Host memory could not be reserved.
    #[error("host allocation of {0} bytes failed")]
    Allocation(usize),
    /// A buffer was requested before `size_init`.
    #[error("buffer size is not initialized, call size_init first")]
    UninitializedSize,
    /// `size_init` was called with an unusable size.
    #[error("invalid buffer size {0}")]
    InvalidSize(usize),
    /// Device memory could not be reserved.
    #[error("device allocation of {size} bytes failed: {reason}")]
    DeviceAllocation {
        /// requested bytes
        size: usize,
        /// backend description
        reason: String,
    },
    /// No buffer pair is registered at the index.
    #[error("buffer index {0} out of range")]
    IndexOutOfRange(usize),
    /// The pair exists but the requested side was never allocated.
    #[error("{side} buffer at index {index} is not allocated")]
    BufferNotAllocated {
        /// buffer pair index
        index: usize,
        /// missing side
        side: Side,
    },
    /// Host and device buffers at the index disagree on their size.
    #[error("size mismatch at index {index}: host {host} bytes, device {device} bytes")]
    SizeMismatch {
        /// buffer pair index
        index: usize,
        /// host buffer size
        host: usize,
        /// device buffer size
        device: usize,
    },
    /// Backend failed to move data between host and device.
    #[error("transfer failed: {0}")]
    Transfer(String),
    /// Backend rejected the dispatch configuration or kernel.
    #[error("launch rejected: {0}")]
    Launch(String),
    /// A host buffer cannot be viewed as the requested element type.
    #[error("host buffer at index {index} cannot be viewed as {ty}: {reason}")]
    View {
        /// buffer pair index
        index: usize,
        /// element type
        ty: &'static str,
        /// size or alignment problem
        reason: String,
    },
    /// Kernel execution failed on the device.
    #[error("kernel fault: {0}")]
    KernelFault(String),
    /// The index is referenced by a launch whose completion was not observed yet.
    #[error("buffer at index {0} is in use by an in-flight launch")]
    BufferBusy(usize),
    /// A launch handle was passed to a worker that did not issue it.
    #[error("launch {launch} belongs to {owner}, not {worker}")]
    ForeignLaunch {
        /// launch id
        launch: usize,
        /// issuing worker
        owner: WorkerId,
        /// worker asked to wait
        worker: WorkerId,
    },
    /// Error from the Cuda driver
    #[cfg(feature = "cuda")]
    #[error("cuda error {0:?}")]
    Cuda(cuda_driver_sys::cudaError_enum),
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
