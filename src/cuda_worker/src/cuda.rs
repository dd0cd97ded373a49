//! CudaDevice drives one GPU through the Cuda driver API.
//! It owns a context on the device; every call makes that context current first.

use crate::backend::{Backend, DeviceLimits, DevicePtr, KernelArgument};
use crate::idmap::IdMap;
use crate::utils::ToResult;
use crate::{Error, FunctionId, LaunchDim, Result};
use cuda_driver_sys::{self as cuda, cudaError_enum, CUdevice_attribute_enum};
use std::{
    ffi::CStr,
    os::raw::{c_char, c_int},
    sync::{Mutex, RwLock},
    time::Instant,
};

struct CudaModule(cuda::CUmodule);
impl Drop for CudaModule {
    fn drop(&mut self) {
        unsafe {
            cuda::cuModuleUnload(self.0);
        }
    }
}

/// Backend on a Cuda capable GPU.
pub struct CudaDevice {
    gpu_id: i32,
    name: String,
    context: cuda::CUcontext,
    limits: DeviceLimits,
    modules: Mutex<IdMap<CudaModule>>,
    functions: RwLock<IdMap<cuda::CUfunction>>,
}

// SAFETY: the context and handles are only used after making the context current, and the
// maps holding them are behind locks.
unsafe impl Send for CudaDevice {}
unsafe impl Sync for CudaDevice {}

fn attribute(device: cuda::CUdevice, attribute: CUdevice_attribute_enum) -> Result<u32> {
    let mut value: c_int = 0;
    unsafe {
        cuda::cuDeviceGetAttribute(&mut value as *mut _, attribute, device).to_result()?;
    }
    Ok(value as u32)
}

impl CudaDevice {
    /// Initialize Cuda and create a context on GPU `gpu_id`.
    pub fn new(gpu_id: i32) -> Result<Self> {
        unsafe {
            cuda::cuInit(0).to_result()?;
        }
        let mut device: cuda::CUdevice = 0;
        unsafe {
            cuda::cuDeviceGet(&mut device as *mut _, gpu_id).to_result()?;
        }
        let name = unsafe {
            let mut buf = [0 as c_char; 256];
            cuda::cuDeviceGetName(buf.as_mut_ptr(), buf.len() as c_int, device).to_result()?;
            CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
        };
        let limits = DeviceLimits {
            max_threads_per_block: attribute(
                device,
                CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
            )?,
            max_shared_memory: attribute(
                device,
                CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK,
            )?,
        };
        let context = unsafe {
            let mut context = std::ptr::null_mut();
            cuda::cuCtxCreate_v2(&mut context as *mut _, 0x8, device).to_result()?;
            context
        };
        log::info!("GPU[{}] {} {:?}", gpu_id, name, limits);
        Ok(CudaDevice {
            gpu_id,
            name,
            context,
            limits,
            modules: Mutex::new(IdMap::new()),
            functions: RwLock::new(IdMap::new()),
        })
    }

    fn set_context(&self) -> Result<()> {
        unsafe { cuda::cuCtxSetCurrent(self.context).to_result() }
    }

    /// Load Cuda Module (PTX or cubin, PTX must be nul terminated) and get module_id.
    pub fn load_module(&self, module_data: &[u8]) -> Result<usize> {
        self.set_context()?;
        let module = unsafe {
            let mut module = std::ptr::null_mut();
            cuda::cuModuleLoadData(&mut module as *mut _, module_data.as_ptr() as *const _)
                .to_result()?;
            module
        };
        Ok(self.modules.lock().unwrap().insert(CudaModule(module)))
    }

    /// Get Cuda Function from given module_id and nul terminated function_name.
    pub fn get_function(&self, module_id: usize, function_name: &[u8]) -> Result<FunctionId> {
        self.set_context()?;
        let module = {
            let modules = self.modules.lock().unwrap();
            modules
                .get(module_id)
                .map(|module| module.0)
                .ok_or_else(|| Error::Launch(format!("unknown module {}", module_id)))?
        };
        let function = unsafe {
            let mut function = std::ptr::null_mut();
            cuda::cuModuleGetFunction(
                &mut function as *mut _,
                module,
                function_name.as_ptr() as *const _,
            )
            .to_result()?;
            function
        };
        Ok(FunctionId(self.functions.write().unwrap().insert(function)))
    }

    /// GPU ordinal
    pub fn gpu_id(&self) -> i32 {
        self.gpu_id
    }
}

impl Drop for CudaDevice {
    fn drop(&mut self) {
        if let Ok(modules) = self.modules.get_mut() {
            *modules = IdMap::new();
        }
        unsafe {
            cuda::cuCtxDestroy_v2(self.context);
        }
    }
}

impl Backend for CudaDevice {
    fn name(&self) -> String {
        format!("GPU[{}] {}", self.gpu_id, self.name)
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn allocate(&self, size: usize) -> Result<DevicePtr> {
        self.set_context()?;
        let mut pointer = 0u64;
        let status = unsafe { cuda::cuMemAlloc_v2(&mut pointer as *mut _, size) };
        match status {
            cudaError_enum::CUDA_SUCCESS => Ok(DevicePtr(pointer)),
            err => Err(Error::DeviceAllocation {
                size,
                reason: format!("{:?}", err),
            }),
        }
    }

    fn release(&self, ptr: DevicePtr) {
        if self.set_context().is_ok() {
            unsafe {
                let _ = cuda::cuMemFree_v2(ptr.0).to_result();
            }
        }
    }

    fn copy_to_device(&self, ptr: DevicePtr, source: &[u8]) -> Result<()> {
        self.set_context()?;
        unsafe {
            cuda::cuMemcpyHtoD_v2(ptr.0, source.as_ptr() as *const _, source.len())
                .to_result()
                .map_err(|e| Error::Transfer(e.to_string()))
        }
    }

    fn copy_to_host(&self, dest: &mut [u8], ptr: DevicePtr) -> Result<()> {
        self.set_context()?;
        unsafe {
            cuda::cuMemcpyDtoH_v2(dest.as_mut_ptr() as *mut _, ptr.0, dest.len())
                .to_result()
                .map_err(|e| Error::Transfer(e.to_string()))
        }
    }

    fn launch(
        &self,
        function: FunctionId,
        args: &[KernelArgument],
        dim: &LaunchDim,
    ) -> Result<()> {
        self.limits.validate(dim).map_err(Error::Launch)?;
        self.set_context()?;
        let function = {
            let functions = self.functions.read().unwrap();
            *functions
                .get(function.0)
                .ok_or_else(|| Error::Launch(format!("unknown function {:?}", function)))?
        };
        let now = Instant::now();
        let mut cuda_args = args
            .iter()
            .map(|arg| match arg {
                KernelArgument::Pointer(pointer) => pointer.0,
                KernelArgument::Other(x) => *x,
            })
            .collect::<Vec<_>>();
        let mut kernel_params: Vec<*mut std::ffi::c_void> = cuda_args
            .iter_mut()
            .map(|arg| arg as *mut _ as *mut _)
            .collect();
        unsafe {
            cuda::cuLaunchKernel(
                function,
                dim.grid,
                1,
                1,
                dim.block,
                1,
                1,
                dim.shared_mem,
                std::ptr::null_mut(),
                kernel_params.as_mut_ptr(),
                std::ptr::null_mut(),
            )
            .to_result()
            .map_err(|e| Error::Launch(e.to_string()))?;
            cuda::cuCtxSynchronize()
                .to_result()
                .map_err(|e| Error::KernelFault(e.to_string()))?;
        }
        log::debug!("Kernel {} {:?}", dim, now.elapsed());
        Ok(())
    }
}
