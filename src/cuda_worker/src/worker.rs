//! Worker owns index-addressed host/device buffer pairs of one uniform size.
//!
//! Typical flow: `size_init` → `host_init`/`device_init` per index → `transform_idx` to
//! populate → `copy_host_to_device` → `launch` → `swap_idx`/`copy_device_to_host` → `cleanup`.

use crate::backend::{DeviceLimits, DevicePtr, KernelArgument};
use crate::context::{DeviceContext, WorkerId, WorkerStatus};
use crate::launch::{self, InFlight, LaunchHandle};
use crate::{Error, KernelArg, KernelDescriptor, LaunchDim, Result, Side};
use bytemuck::Pod;
use std::{collections::HashSet, fmt, ops::Deref, sync::Arc, time::Instant};

/// Host resident buffer.
///
/// Backed by 8-byte words so typed views of common element types are always aligned.
pub struct HostBuffer {
    words: Vec<u64>,
    len: usize,
}

impl HostBuffer {
    fn zeroed(len: usize) -> Result<Self> {
        let count = len / 8 + (len % 8 != 0) as usize;
        let mut words = Vec::new();
        words
            .try_reserve_exact(count)
            .map_err(|_| Error::Allocation(len))?;
        words.resize(count, 0);
        Ok(HostBuffer { words, len })
    }

    /// Bytes of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    /// Mutable bytes of the buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }

    /// View the buffer as elements of `T`, if size and alignment allow.
    pub fn try_as<T: Pod>(&self) -> Option<&[T]> {
        bytemuck::try_cast_slice(self.as_slice()).ok()
    }
}

impl Deref for HostBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len).finish()
    }
}

/// Handle of a device allocation with its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffer {
    ptr: DevicePtr,
    len: usize,
}

impl DeviceBuffer {
    /// Device address
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the allocation holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Default)]
struct BufferPair {
    host: Option<HostBuffer>,
    device: Option<DeviceBuffer>,
}

/// Unit managing buffer pairs and a dispatch configuration on one DeviceContext.
pub struct Worker<'ctx> {
    context: &'ctx DeviceContext,
    id: WorkerId,
    copies: Vec<BufferPair>,
    size: Option<usize>,
    dim: Option<LaunchDim>,
    in_flight: InFlight,
}

impl<'ctx> Worker<'ctx> {
    pub(crate) fn new(context: &'ctx DeviceContext, id: WorkerId) -> Self {
        Worker {
            context,
            id,
            copies: vec![],
            size: None,
            dim: None,
            in_flight: InFlight::new(id),
        }
    }

    /// Registry id inside the owning context.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Context this worker is bound to.
    pub fn context(&self) -> &'ctx DeviceContext {
        self.context
    }

    /// Number of registered buffer pairs.
    pub fn len(&self) -> usize {
        self.copies.len()
    }

    /// Whether no buffer pair is registered.
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    /// Buffer size set by the last `size_init`.
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    /// Dispatch configuration set by the last `set_dim`.
    pub fn dim(&self) -> Option<LaunchDim> {
        self.dim
    }

    /// Set the byte size of every buffer allocated from now on.
    pub fn size_init(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidSize(size));
        }
        self.size = Some(size);
        Ok(())
    }

    /// Allocate a zeroed host buffer at `index`, replacing any previous one.
    pub fn host_init(&mut self, index: usize) -> Result<()> {
        let size = self.size.ok_or(Error::UninitializedSize)?;
        self.in_flight.check(index)?;
        self.reserve(index)?;
        let buffer = HostBuffer::zeroed(size)?;
        self.entry(index).host = Some(buffer);
        log::debug!("{} host buffer {} ({} bytes)", self.id, index, size);
        self.publish();
        Ok(())
    }

    /// Allocate a device buffer at `index`, releasing any previous one.
    pub fn device_init(&mut self, index: usize) -> Result<()> {
        let size = self.size.ok_or(Error::UninitializedSize)?;
        self.in_flight.check(index)?;
        self.reserve(index)?;
        let context = self.context;
        let backend = context.backend();
        let ptr = backend.allocate(size)?;
        let buffer = DeviceBuffer { ptr, len: size };
        if let Some(old) = self.entry(index).device.replace(buffer) {
            backend.release(old.ptr);
        }
        log::debug!(
            "{} device buffer {} at {} ({} bytes)",
            self.id,
            index,
            ptr,
            size
        );
        self.publish();
        Ok(())
    }

    /// Host buffer at `index`.
    pub fn get_host_copies_dx(&self, index: usize) -> Result<&HostBuffer> {
        self.pair(index)?
            .host
            .as_ref()
            .ok_or(Error::BufferNotAllocated {
                index,
                side: Side::Host,
            })
    }

    /// Mutable host buffer at `index`.
    pub fn get_host_copies_dx_mut(&mut self, index: usize) -> Result<&mut HostBuffer> {
        self.in_flight.check(index)?;
        self.pair_mut(index)?
            .host
            .as_mut()
            .ok_or(Error::BufferNotAllocated {
                index,
                side: Side::Host,
            })
    }

    /// Device buffer at `index`.
    pub fn get_device_copies_dx(&self, index: usize) -> Result<&DeviceBuffer> {
        self.pair(index)?
            .device
            .as_ref()
            .ok_or(Error::BufferNotAllocated {
                index,
                side: Side::Device,
            })
    }

    /// Apply `f` in place to the host bytes at `index`.
    pub fn transform_idx<F>(&mut self, index: usize, f: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let host = self.get_host_copies_dx_mut(index)?;
        f(host.as_mut_slice());
        Ok(())
    }

    /// Apply `f` in place to the host buffer at `index` viewed as elements of `T`.
    pub fn transform_idx_as<T, F>(&mut self, index: usize, f: F) -> Result<()>
    where
        T: Pod,
        F: FnOnce(&mut [T]),
    {
        let host = self.get_host_copies_dx_mut(index)?;
        let elements = bytemuck::try_cast_slice_mut::<u8, T>(host.as_mut_slice()).map_err(|e| {
            Error::View {
                index,
                ty: std::any::type_name::<T>(),
                reason: format!("{:?}", e),
            }
        })?;
        f(elements);
        Ok(())
    }

    /// Copy the host buffer at `index` into the device buffer at the same index.
    pub fn copy_host_to_device(&mut self, index: usize) -> Result<()> {
        self.in_flight.check(index)?;
        let (host, device) = self.both(index)?;
        let now = Instant::now();
        self.context
            .backend()
            .copy_to_device(device.ptr, host.as_slice())?;
        log::debug!("{} HtoD {} {:?}", self.id, index, now.elapsed());
        Ok(())
    }

    /// Copy the device buffer at `index` back into the host buffer at the same index.
    pub fn copy_device_to_host(&mut self, index: usize) -> Result<()> {
        self.in_flight.check(index)?;
        let context = self.context;
        let backend = context.backend();
        let (host, device) = self.both_mut(index)?;
        let now = Instant::now();
        backend.copy_to_host(host.as_mut_slice(), device.ptr)?;
        log::debug!("{} DtoH {} {:?}", self.id, index, now.elapsed());
        Ok(())
    }

    /// Exchange the contents of the host and device buffers at `index`.
    ///
    /// Both buffers keep their identity; only bytes move.
    pub fn swap_idx(&mut self, index: usize) -> Result<()> {
        self.in_flight.check(index)?;
        let context = self.context;
        let backend = context.backend();
        let (host, device) = self.both_mut(index)?;
        let mut staging = HostBuffer::zeroed(device.len)?;
        backend.copy_to_host(staging.as_mut_slice(), device.ptr)?;
        backend.copy_to_device(device.ptr, host.as_slice())?;
        host.as_mut_slice().copy_from_slice(staging.as_slice());
        log::debug!("{} swap {}", self.id, index);
        Ok(())
    }

    /// Record the dispatch configuration and return the previous one.
    pub fn set_dim(&mut self, dim: LaunchDim) -> Option<LaunchDim> {
        self.dim.replace(dim)
    }

    /// Run `kernel` under the recorded dimensions and return once it has completed.
    pub fn launch(&mut self, kernel: &KernelDescriptor) -> Result<()> {
        let (dim, args, _) = self.resolve(kernel)?;
        let elapsed = launch::run(
            self.context.backend().as_ref(),
            kernel.function(),
            &args,
            &dim,
        )?;
        log::debug!(
            "{} kernel {:?} {} {:?}",
            self.id,
            kernel.function(),
            dim,
            elapsed
        );
        Ok(())
    }

    /// Start `kernel` under the recorded dimensions without waiting for it.
    ///
    /// Buffer indices used by the kernel are busy until [`Worker::wait`] observes completion.
    pub fn launch_async(&mut self, kernel: &KernelDescriptor) -> Result<LaunchHandle> {
        let (dim, args, indices) = self.resolve(kernel)?;
        let handle = self.in_flight.spawn(
            Arc::clone(self.context.backend()),
            kernel.function(),
            args,
            dim,
            indices,
        );
        log::debug!(
            "{} kernel {:?} {} issued as launch {}",
            self.id,
            kernel.function(),
            dim,
            handle.id()
        );
        self.publish();
        Ok(handle)
    }

    /// Block until the launch behind `handle` completes and release its buffers.
    ///
    /// A launch already collected by `cleanup` still reports its fault here. Handles issued by
    /// another worker are rejected with [`Error::ForeignLaunch`].
    pub fn wait(&mut self, handle: LaunchHandle) -> Result<()> {
        let result = self.in_flight.wait(&handle);
        self.publish();
        if let Some(elapsed) = result? {
            log::debug!("{} launch {} finished {:?}", self.id, handle.id(), elapsed);
        }
        Ok(())
    }

    /// Snapshot of the worker's configuration and buffers.
    pub fn get_info(&self) -> WorkerInfo {
        let info = WorkerInfo {
            id: self.id,
            backend: self.context.backend().name(),
            limits: self.context.limits(),
            size: self.size,
            dim: self.dim,
            pairs: self
                .copies
                .iter()
                .map(|pair| (pair.host.is_some(), pair.device.is_some()))
                .collect(),
            in_flight: self.in_flight.len(),
        };
        log::info!("{}", info);
        info
    }

    /// Wait for in-flight launches, release every buffer and forget all indices.
    ///
    /// Calling it on an empty worker does nothing.
    pub fn cleanup(&mut self) {
        self.release_all();
        self.publish();
    }

    fn release_all(&mut self) {
        self.in_flight.drain();
        let context = self.context;
        let backend = context.backend();
        for pair in self.copies.drain(..) {
            if let Some(device) = pair.device {
                backend.release(device.ptr);
            }
        }
    }

    fn resolve(
        &self,
        kernel: &KernelDescriptor,
    ) -> Result<(LaunchDim, Vec<KernelArgument>, Vec<usize>)> {
        let dim = self
            .dim
            .ok_or_else(|| Error::Launch("dimension configuration not set".to_string()))?;
        let mut indices = vec![];
        let mut seen = HashSet::new();
        let mut args = vec![];
        for arg in kernel.args() {
            match *arg {
                KernelArg::Buffer(index) => {
                    if !seen.insert(index) {
                        return Err(Error::Launch(format!("buffer {} bound twice", index)));
                    }
                    self.in_flight.check(index)?;
                    let device = self.get_device_copies_dx(index)?;
                    args.push(KernelArgument::Pointer(device.ptr));
                    indices.push(index);
                }
                KernelArg::Scalar(value) => args.push(KernelArgument::Other(value)),
            }
        }
        Ok((dim, args, indices))
    }

    /// Make room for `index` without growing the index domain yet.
    fn reserve(&mut self, index: usize) -> Result<()> {
        if index < self.copies.len() {
            return Ok(());
        }
        let additional = (index - self.copies.len())
            .checked_add(1)
            .ok_or(Error::Allocation(usize::MAX))?;
        self.copies.try_reserve(additional).map_err(|_| {
            Error::Allocation(additional.saturating_mul(std::mem::size_of::<BufferPair>()))
        })
    }

    /// Pair at `index`, filling the gap with empty pairs. Call `reserve` first.
    fn entry(&mut self, index: usize) -> &mut BufferPair {
        if index >= self.copies.len() {
            self.copies.resize_with(index + 1, BufferPair::default);
        }
        &mut self.copies[index]
    }

    fn pair(&self, index: usize) -> Result<&BufferPair> {
        self.copies.get(index).ok_or(Error::IndexOutOfRange(index))
    }

    fn pair_mut(&mut self, index: usize) -> Result<&mut BufferPair> {
        self.copies.get_mut(index).ok_or(Error::IndexOutOfRange(index))
    }

    fn both(&self, index: usize) -> Result<(&HostBuffer, DeviceBuffer)> {
        let host = self.get_host_copies_dx(index)?;
        let device = *self.get_device_copies_dx(index)?;
        check_sizes(index, host, &device)?;
        Ok((host, device))
    }

    fn both_mut(&mut self, index: usize) -> Result<(&mut HostBuffer, DeviceBuffer)> {
        let device = *self.get_device_copies_dx(index)?;
        let host = self.get_host_copies_dx_mut(index)?;
        check_sizes(index, host, &device)?;
        Ok((host, device))
    }

    fn publish(&self) {
        let status = WorkerStatus {
            pairs: self.copies.len(),
            device_bytes: self
                .copies
                .iter()
                .filter_map(|pair| pair.device.as_ref())
                .map(|device| device.len)
                .sum(),
            in_flight: self.in_flight.len(),
        };
        self.context.publish(self.id, status);
    }
}

fn check_sizes(index: usize, host: &HostBuffer, device: &DeviceBuffer) -> Result<()> {
    if host.len == device.len {
        Ok(())
    } else {
        Err(Error::SizeMismatch {
            index,
            host: host.len,
            device: device.len,
        })
    }
}

impl Drop for Worker<'_> {
    fn drop(&mut self) {
        if !self.copies.is_empty() || self.in_flight.len() > 0 {
            log::warn!(
                "{} dropped holding {} buffer pairs and {} launches, releasing",
                self.id,
                self.copies.len(),
                self.in_flight.len()
            );
        }
        self.release_all();
        self.context.unsubscribe(self.id);
    }
}

impl fmt::Debug for Worker<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("dim", &self.dim)
            .field("copies", &self.copies)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

/// Read-only report produced by [`Worker::get_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Worker id
    pub id: WorkerId,
    /// Backend name
    pub backend: String,
    /// Backend dispatch limits
    pub limits: DeviceLimits,
    /// Uniform buffer size
    pub size: Option<usize>,
    /// Dispatch configuration
    pub dim: Option<LaunchDim>,
    /// (host allocated, device allocated) per index
    pub pairs: Vec<(bool, bool)>,
    /// Launches not observed yet
    pub in_flight: usize,
}

impl fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.id, self.backend)?;
        write!(
            f,
            " (block <= {}, shared <= {})",
            self.limits.max_threads_per_block, self.limits.max_shared_memory
        )?;
        match self.size {
            Some(size) => write!(f, "\nsize: {} bytes", size)?,
            None => write!(f, "\nsize: unset")?,
        }
        match self.dim {
            Some(dim) => write!(f, "\ndim: {}", dim)?,
            None => write!(f, "\ndim: unset")?,
        }
        for (index, (host, device)) in self.pairs.iter().enumerate() {
            let mark = |b: &bool| if *b { "allocated" } else { "-" };
            write!(f, "\n[{}] host {} device {}", index, mark(host), mark(device))?;
        }
        write!(f, "\nin flight: {}", self.in_flight)
    }
}
