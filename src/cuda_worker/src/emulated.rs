//! EmulatedDevice keeps "device" memory in the host process and runs kernels as Rust closures.
//!
//! It honours the same contract as a real device: bounded capacity, launch limits, and
//! memory that is only reachable through explicit copies. Kernels receive the whole launch
//! configuration and iterate `grid * block` themselves.

use crate::backend::{Backend, DeviceLimits, DevicePtr, KernelArgument};
use crate::idmap::IdMap;
use crate::{Error, FunctionId, LaunchDim, Result};
use std::{
    collections::{HashMap, HashSet},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, RwLock},
    time::Instant,
};

/// Argument as seen by an emulated kernel.
#[derive(Debug)]
pub enum EmulatedArg<'a> {
    /// Contents of a device allocation
    Buffer(&'a mut [u8]),
    /// Plain value
    Scalar(u64),
}

impl<'a> EmulatedArg<'a> {
    /// Device memory of a pointer argument.
    pub fn as_buffer(&mut self) -> Option<&mut [u8]> {
        match self {
            EmulatedArg::Buffer(buffer) => Some(&mut **buffer),
            EmulatedArg::Scalar(_) => None,
        }
    }

    /// Value of a scalar argument.
    pub fn as_scalar(&self) -> Option<u64> {
        match self {
            EmulatedArg::Scalar(value) => Some(*value),
            EmulatedArg::Buffer(_) => None,
        }
    }
}

/// Kernel body run by an EmulatedDevice; an `Err` is reported as a kernel fault.
pub type EmulatedKernel =
    dyn Fn(&LaunchDim, &mut [EmulatedArg<'_>]) -> Result<(), String> + Send + Sync;

const BASE_ADDRESS: u64 = 0x1000;
const ALIGNMENT: u64 = 256;

struct Memory {
    allocations: HashMap<u64, Vec<u8>>,
    bump: u64,
    used: usize,
}

#[derive(Default)]
struct Functions {
    kernels: IdMap<(String, Arc<EmulatedKernel>)>,
    names: HashMap<String, usize>,
}

/// In-process device.
pub struct EmulatedDevice {
    name: String,
    capacity: usize,
    limits: DeviceLimits,
    memory: Mutex<Memory>,
    functions: RwLock<Functions>,
}

/// Builder for EmulatedDevice
pub struct Builder {
    name: String,
    capacity: usize,
    max_threads_per_block: u32,
    max_shared_memory: u32,
}

macro_rules! config {
    ($name:ident, $t: ty, $comment: literal) => {
        #[doc=$comment]
        pub fn $name(mut self, $name: $t) -> Self {
            self.$name = $name;
            self
        }
    };
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            name: "emulated".to_string(),
            capacity: 256 << 20,
            max_threads_per_block: 1024,
            max_shared_memory: 48 << 10,
        }
    }
}

impl Builder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Builder::default()
    }

    config!(name, String, "Device name reported by get_info");
    config!(capacity, usize, "Device memory in bytes");
    config!(max_threads_per_block, u32, "Largest accepted block size");
    config!(max_shared_memory, u32, "Largest accepted shared memory per block");

    /// Build the device
    pub fn build(self) -> EmulatedDevice {
        EmulatedDevice {
            name: self.name,
            capacity: self.capacity,
            limits: DeviceLimits {
                max_threads_per_block: self.max_threads_per_block,
                max_shared_memory: self.max_shared_memory,
            },
            memory: Mutex::new(Memory {
                allocations: HashMap::new(),
                bump: BASE_ADDRESS,
                used: 0,
            }),
            functions: RwLock::new(Functions::default()),
        }
    }
}

impl EmulatedDevice {
    /// Create an EmulatedDevice with default configuration.
    pub fn new() -> Self {
        Builder::new().build()
    }

    /// Register a kernel under `name` and get its function id.
    ///
    /// Registering a name again makes later lookups return the new kernel.
    pub fn register_function<F>(&self, name: &str, kernel: F) -> FunctionId
    where
        F: 'static + Fn(&LaunchDim, &mut [EmulatedArg<'_>]) -> Result<(), String> + Send + Sync,
    {
        let mut functions = self.functions.write().unwrap();
        let id = functions
            .kernels
            .insert((name.to_string(), Arc::new(kernel)));
        functions.names.insert(name.to_string(), id);
        FunctionId(id)
    }

    /// Look up a registered kernel by name.
    pub fn get_function(&self, name: &str) -> Option<FunctionId> {
        let functions = self.functions.read().unwrap();
        functions.names.get(name).map(|&id| FunctionId(id))
    }

    /// Bytes currently allocated.
    pub fn used_bytes(&self) -> usize {
        self.memory.lock().unwrap().used
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.memory.lock().unwrap().allocations.len()
    }

    /// Device capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        EmulatedDevice::new()
    }
}

impl Backend for EmulatedDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn allocate(&self, size: usize) -> Result<DevicePtr> {
        let mut memory = self.memory.lock().unwrap();
        if size > self.capacity.saturating_sub(memory.used) {
            return Err(Error::DeviceAllocation {
                size,
                reason: format!(
                    "out of memory, {} of {} bytes in use",
                    memory.used, self.capacity
                ),
            });
        }
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(size)
            .map_err(|e| Error::DeviceAllocation {
                size,
                reason: e.to_string(),
            })?;
        buffer.resize(size, 0);
        let ptr = memory.bump;
        let span = (size as u64).max(1);
        memory.bump += (span + ALIGNMENT - 1) / ALIGNMENT * ALIGNMENT;
        memory.used += size;
        memory.allocations.insert(ptr, buffer);
        Ok(DevicePtr(ptr))
    }

    fn release(&self, ptr: DevicePtr) {
        let mut memory = self.memory.lock().unwrap();
        match memory.allocations.remove(&ptr.0) {
            Some(buffer) => memory.used -= buffer.len(),
            None => log::warn!("Release of unknown device pointer {}", ptr),
        }
    }

    fn copy_to_device(&self, ptr: DevicePtr, source: &[u8]) -> Result<()> {
        let mut memory = self.memory.lock().unwrap();
        let dest = memory
            .allocations
            .get_mut(&ptr.0)
            .ok_or_else(|| Error::Transfer(format!("unknown device pointer {}", ptr)))?;
        if dest.len() < source.len() {
            return Err(Error::Transfer(format!(
                "device buffer {} holds {} bytes, copy of {} bytes",
                ptr,
                dest.len(),
                source.len()
            )));
        }
        dest[..source.len()].copy_from_slice(source);
        Ok(())
    }

    fn copy_to_host(&self, dest: &mut [u8], ptr: DevicePtr) -> Result<()> {
        let memory = self.memory.lock().unwrap();
        let source = memory
            .allocations
            .get(&ptr.0)
            .ok_or_else(|| Error::Transfer(format!("unknown device pointer {}", ptr)))?;
        if source.len() < dest.len() {
            return Err(Error::Transfer(format!(
                "device buffer {} holds {} bytes, copy of {} bytes",
                ptr,
                source.len(),
                dest.len()
            )));
        }
        dest.copy_from_slice(&source[..dest.len()]);
        Ok(())
    }

    fn launch(
        &self,
        function: FunctionId,
        args: &[KernelArgument],
        dim: &LaunchDim,
    ) -> Result<()> {
        self.limits.validate(dim).map_err(Error::Launch)?;
        let (name, kernel) = {
            let functions = self.functions.read().unwrap();
            functions
                .kernels
                .get(function.0)
                .cloned()
                .ok_or_else(|| Error::Launch(format!("unknown function {:?}", function)))?
        };
        let mut seen = HashSet::new();
        for arg in args {
            if let KernelArgument::Pointer(ptr) = arg {
                if !seen.insert(*ptr) {
                    return Err(Error::Launch(format!("device pointer {} passed twice", ptr)));
                }
            }
        }

        // Pointer arguments are moved out of the memory map while the kernel runs.
        let mut taken = {
            let mut memory = self.memory.lock().unwrap();
            if let Some(missing) = seen.iter().find(|ptr| !memory.allocations.contains_key(&ptr.0))
            {
                return Err(Error::KernelFault(format!(
                    "illegal address {} in {}",
                    missing, name
                )));
            }
            args.iter()
                .map(|arg| match arg {
                    KernelArgument::Pointer(ptr) => memory
                        .allocations
                        .remove(&ptr.0)
                        .map(|buffer| (ptr.0, buffer)),
                    KernelArgument::Other(_) => None,
                })
                .collect::<Vec<_>>()
        };

        let now = Instant::now();
        let outcome = {
            let mut call_args = args
                .iter()
                .zip(taken.iter_mut())
                .map(|(arg, slot)| match (arg, slot) {
                    (_, Some((_, buffer))) => EmulatedArg::Buffer(buffer.as_mut_slice()),
                    (KernelArgument::Other(value), None) => EmulatedArg::Scalar(*value),
                    (KernelArgument::Pointer(_), None) => unreachable!("pointer checked above"),
                })
                .collect::<Vec<_>>();
            panic::catch_unwind(AssertUnwindSafe(|| kernel(dim, &mut call_args)))
        };

        {
            let mut memory = self.memory.lock().unwrap();
            for (ptr, buffer) in taken.into_iter().flatten() {
                memory.allocations.insert(ptr, buffer);
            }
        }
        log::debug!("Kernel {} {} {:?}", name, dim, now.elapsed());

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(Error::KernelFault(format!("{}: {}", name, msg))),
            Err(_) => Err(Error::KernelFault(format!("{} panicked", name))),
        }
    }
}
