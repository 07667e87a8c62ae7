//! ipcreg - Cross-process registry of GPU IPC memory handles

pub mod cache;
pub mod config;
pub mod counter;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod error;
pub mod handle;
pub mod registry;
pub mod runtime;
pub mod segment;
pub mod shm;
pub mod table;

pub use config::RegistryConfig;
#[cfg(feature = "cuda")]
pub use cuda::{CudaRuntime, ImportedMemory};
pub use error::{Error, Result};
pub use handle::{split_aligned, IpcMemHandle, RawIpcHandle, IPC_ALIGNMENT, IPC_HANDLE_SIZE};
pub use registry::{Presence, Registry, SegmentStats};
pub use runtime::{IpcRuntime, NoRuntime};
pub use table::{CAPACITY, NAME_MAX_LEN};

/// Register `ptr` under `name` in the global registry
pub fn register(ptr: u64, size: u64, name: &str) -> Result<()> {
    Registry::global().register(ptr, size, name)
}

/// Remove `name` from the global registry
pub fn deregister(name: &str) -> Result<()> {
    Registry::global().deregister(name)
}

pub fn lookup_once(name: &str) -> Result<IpcMemHandle> {
    Registry::global().lookup_once(name)
}

pub fn lookup_blocking(name: &str) -> Result<IpcMemHandle> {
    Registry::global().lookup_blocking(name)
}

pub fn check_exists(name: &str) -> Presence {
    Registry::global().check_exists(name)
}
