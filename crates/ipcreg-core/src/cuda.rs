//! CUDA IPC support

use crate::handle::{IpcMemHandle, RawIpcHandle, IPC_HANDLE_SIZE};
use crate::runtime::IpcRuntime;
use crate::{Error, Result};
use cudarc::driver::sys;
use cudarc::driver::CudaDevice;
use std::sync::Arc;

const _: () = assert!(std::mem::size_of::<sys::CUipcMemHandle>() == IPC_HANDLE_SIZE);

/// Exports handles with the CUDA driver API
#[derive(Debug, Default, Clone, Copy)]
pub struct CudaRuntime;

impl IpcRuntime for CudaRuntime {
    /// Get IPC handle from device pointer (using CUDA driver API)
    fn get_ipc_handle(&self, aligned_ptr: u64) -> Result<RawIpcHandle> {
        let mut handle: RawIpcHandle = [0u8; IPC_HANDLE_SIZE];

        unsafe {
            let result = sys::cuIpcGetMemHandle(handle.as_mut_ptr() as *mut _, aligned_ptr);
            if result != sys::CUresult::CUDA_SUCCESS {
                return Err(Error::Driver(format!("cuIpcGetMemHandle failed: {:?}", result)));
            }
        }

        Ok(handle)
    }
}

/// Device memory imported from another process
pub struct ImportedMemory {
    _device: Arc<CudaDevice>,
    device_id: i32,
    base: u64,
    offset: u64,
    size: u64,
}

impl ImportedMemory {
    /// Open a registered handle on `device_id`
    pub fn open(device_id: i32, handle: &IpcMemHandle) -> Result<Self> {
        // Binds a context to this thread for the driver calls below.
        let device = CudaDevice::new(device_id as usize).map_err(|e| Error::Driver(e.to_string()))?;

        let base = Self::open_ipc_handle(&handle.handle)?;

        Ok(Self {
            _device: device,
            device_id,
            base,
            offset: handle.offset,
            size: handle.size,
        })
    }

    /// Get device ID
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// The registered device pointer in this process's address space
    pub fn device_ptr(&self) -> u64 {
        self.base + self.offset
    }

    /// Get size
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open IPC handle (using CUDA driver API)
    fn open_ipc_handle(handle: &RawIpcHandle) -> Result<u64> {
        let mut ptr: u64 = 0;

        unsafe {
            let raw: sys::CUipcMemHandle = std::ptr::read_unaligned(handle.as_ptr() as *const _);
            let result = sys::cuIpcOpenMemHandle_v2(
                &mut ptr as *mut u64 as *mut _,
                raw,
                sys::CUipcMem_flags::CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS as u32,
            );
            if result != sys::CUresult::CUDA_SUCCESS {
                return Err(Error::Driver(format!("cuIpcOpenMemHandle failed: {:?}", result)));
            }
        }

        Ok(ptr)
    }

    /// Close IPC handle
    fn close_ipc_handle(ptr: u64) -> Result<()> {
        unsafe {
            let result = sys::cuIpcCloseMemHandle(ptr);
            if result != sys::CUresult::CUDA_SUCCESS {
                return Err(Error::Driver(format!("cuIpcCloseMemHandle failed: {:?}", result)));
            }
        }
        Ok(())
    }
}

impl Drop for ImportedMemory {
    fn drop(&mut self) {
        if let Err(e) = Self::close_ipc_handle(self.base) {
            tracing::warn!(error = %e, "failed to close imported IPC memory");
        }
    }
}

// Safety: ImportedMemory can be sent between threads
// CUDA operations are thread-safe when using the driver API
unsafe impl Send for ImportedMemory {}
unsafe impl Sync for ImportedMemory {}
