//! Basic utils

use bytemuck::Pod;

#[cfg(feature = "cuda")]
pub(crate) trait ToResult {
    fn to_result(&self) -> crate::Result<()>;
}

#[cfg(feature = "cuda")]
impl ToResult for cuda_driver_sys::cudaError_enum {
    fn to_result(&self) -> crate::Result<()> {
        use cuda_driver_sys::cudaError_enum;
        match self {
            cudaError_enum::CUDA_SUCCESS => Ok(()),
            cudaError_enum::CUDA_ERROR_DEINITIALIZED => {
                log::warn!("CUDA already deinitialized, maybe the main thread is exited");
                Ok(())
            }
            &err => {
                log::warn!("Cuda Error {:?}", err);
                Err(crate::Error::Cuda(err))
            }
        }
    }
}

/// &[T] to Vec<u8>
pub fn to_bytes<T: Pod>(values: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

/// &[u8] to Vec<T>, trailing bytes that do not fill a whole T are dropped.
///
/// Zero-sized T yields an empty Vec.
pub fn from_bytes<T: Pod>(bytes: &[u8]) -> Vec<T> {
    let size = std::mem::size_of::<T>();
    if size == 0 {
        return Vec::new();
    }
    let whole = bytes.len() - bytes.len() % size;
    bytemuck::pod_collect_to_vec(&bytes[..whole])
}
