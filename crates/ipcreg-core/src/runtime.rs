//! GPU runtime seam

use crate::handle::RawIpcHandle;
use crate::{Error, Result};

/// Exports device allocations as IPC handles.
///
/// Implemented by [`CudaRuntime`](crate::cuda::CudaRuntime) with the `cuda`
/// feature; tests and other backends provide their own.
pub trait IpcRuntime: Send + Sync {
    /// Get the IPC handle for the allocation at `aligned_ptr`
    fn get_ipc_handle(&self, aligned_ptr: u64) -> Result<RawIpcHandle>;
}

/// Runtime used when no GPU backend is compiled in
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRuntime;

impl IpcRuntime for NoRuntime {
    fn get_ipc_handle(&self, _aligned_ptr: u64) -> Result<RawIpcHandle> {
        Err(Error::Driver("no GPU runtime available".to_string()))
    }
}

/// Default runtime for this build
#[cfg(feature = "cuda")]
pub(crate) fn default_runtime() -> std::sync::Arc<dyn IpcRuntime> {
    std::sync::Arc::new(crate::cuda::CudaRuntime)
}

#[cfg(not(feature = "cuda"))]
pub(crate) fn default_runtime() -> std::sync::Arc<dyn IpcRuntime> {
    std::sync::Arc::new(NoRuntime)
}
