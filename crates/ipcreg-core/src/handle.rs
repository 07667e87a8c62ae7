//! IPC memory handle

/// Size of an opaque driver IPC handle (CUDA and HIP both use 64 bytes)
pub const IPC_HANDLE_SIZE: usize = 64;

/// Registered pointers are exported relative to this alignment (1 MiB)
pub const IPC_ALIGNMENT: u64 = 1 << 20;

/// Opaque driver handle bytes
pub type RawIpcHandle = [u8; IPC_HANDLE_SIZE];

/// Handle to a GPU allocation that another process can import.
///
/// `handle` describes the allocation starting at the aligned base address;
/// the registered pointer is `imported_base + offset`.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct IpcMemHandle {
    pub handle: RawIpcHandle,
    pub offset: u64,
    pub size: u64,
}

impl Default for IpcMemHandle {
    fn default() -> Self {
        Self {
            handle: [0u8; IPC_HANDLE_SIZE],
            offset: 0,
            size: 0,
        }
    }
}

impl std::fmt::Debug for IpcMemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcMemHandle")
            .field("handle", &format_args!("{:02x?}..", &self.handle[..8]))
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Split a device address into its aligned base and the offset from it
pub const fn split_aligned(ptr: u64) -> (u64, u64) {
    let base = ptr & !(IPC_ALIGNMENT - 1);
    (base, ptr - base)
}
