//! POSIX shared memory wrapper

use crate::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use shared_memory::{Shmem, ShmemConf};
use std::fs::File;

/// Outcome of an exclusive create
pub enum Created {
    /// This call created and sized the object
    New(SharedMemory),
    /// Another process got there first
    Exists,
}

/// Shared memory mapping wrapper.
///
/// Dropping it unmaps the region but never removes the name; removal is
/// explicit through [`SharedMemory::unlink`].
pub struct SharedMemory {
    inner: Shmem,
    name: String,
}

// Safety: the mapping is plain shared memory. Everything the crate places in
// it is accessed through atomics.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new object of `size` bytes, failing over to `Created::Exists`
    /// if the name is taken. World read/write, subject to the umask.
    pub fn create(name: &str, size: usize) -> Result<Created> {
        let mode = Mode::S_IRUSR
            | Mode::S_IWUSR
            | Mode::S_IRGRP
            | Mode::S_IWGRP
            | Mode::S_IROTH
            | Mode::S_IWOTH;
        let fd = match shm_open(name, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, mode) {
            Ok(fd) => fd,
            Err(Errno::EEXIST) => return Ok(Created::Exists),
            Err(e) => return Err(Error::shm("shm_open create", e)),
        };

        // Size the object, then map it through the same path attachers use.
        let sized = File::from(fd).set_len(size as u64);
        if let Err(e) = sized {
            Self::discard(name);
            return Err(Error::shm("ftruncate", e));
        }

        match Self::open(name) {
            Ok(shm) if shm.size() >= size => Ok(Created::New(shm)),
            Ok(shm) => {
                let got = shm.size();
                drop(shm);
                Self::discard(name);
                Err(Error::SegmentUnavailable(format!(
                    "mapped {} bytes, expected {}",
                    got, size
                )))
            }
            Err(e) => {
                Self::discard(name);
                Err(e)
            }
        }
    }

    /// Open an existing shared memory region
    pub fn open(name: &str) -> Result<Self> {
        let mut shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| Error::shm("open", e))?;
        shmem.set_owner(false);

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
        })
    }

    /// Remove the name from the shared memory namespace
    pub fn unlink(name: &str) -> Result<()> {
        shm_unlink(name).map_err(|e| Error::shm("shm_unlink", e))
    }

    /// Whether an object with this name currently exists
    pub fn exists(name: &str) -> bool {
        !matches!(
            shm_open(name, OFlag::O_RDONLY, Mode::empty()),
            Err(Errno::ENOENT)
        )
    }

    fn discard(name: &str) {
        if let Err(e) = Self::unlink(name) {
            tracing::warn!(name, error = %e, "failed to remove partially created segment");
        }
    }

    /// Get the name of the shared memory region
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of the shared memory region
    pub fn size(&self) -> usize {
        self.inner.len()
    }

    /// Get a raw pointer to the shared memory
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.as_ptr()
    }
}
