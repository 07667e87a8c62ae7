//! Registry segment lifecycle: create-or-attach, refcount, teardown

use crate::counter::LiveItems;
use crate::shm::{Created, SharedMemory};
use crate::table::{Entry, NameTable};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Header at the start of the segment
#[repr(C)]
struct SegmentHeader {
    /// Number of live attachments across all processes
    refcount: AtomicU64,
    /// Live-item counter, see [`LiveItems`]
    itemcount: AtomicU64,
    /// `READY` once the creator has initialized everything else
    ready: AtomicU32,
    /// Table capacity chosen by the creator
    capacity: AtomicU32,
}

const HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();
const _: () = assert!(HEADER_SIZE % std::mem::align_of::<Entry>() == 0);

const READY: u32 = 0x4950_4352; // "IPCR"

/// Pause between attach attempts while another process creates or tears down
const ATTACH_BACKOFF: Duration = Duration::from_millis(1);

/// One process's attachment to the shared registry segment.
///
/// Every successful [`Segment::open_or_attach`] holds one `refcount`
/// increment, given back by [`Segment::detach`] or on drop.
pub struct Segment {
    shm: SharedMemory,
    capacity: usize,
    detached: AtomicBool,
}

impl Segment {
    /// Calculate required size for given capacity
    pub const fn calc_size(capacity: usize) -> usize {
        HEADER_SIZE + capacity * Entry::SIZE
    }

    /// Create the segment, or attach to it if another process already did
    pub fn open_or_attach(name: &str, capacity: usize, ready_timeout: Duration) -> Result<Self> {
        let size = Self::calc_size(capacity);
        let deadline = Instant::now() + ready_timeout;

        loop {
            match SharedMemory::create(name, size)? {
                Created::New(shm) => return Ok(Self::init(shm, capacity)),
                Created::Exists => {
                    if let Some(segment) = Self::try_attach(name, capacity, deadline)? {
                        return Ok(segment);
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::SegmentUnavailable(format!(
                    "{}: timed out attaching",
                    name
                )));
            }
            thread::sleep(ATTACH_BACKOFF);
        }
    }

    fn init(shm: SharedMemory, capacity: usize) -> Self {
        // Nobody reads past the header until `ready` is published.
        unsafe {
            std::ptr::write_bytes(shm.as_ptr().add(HEADER_SIZE), 0, capacity * Entry::SIZE);
        }

        let header = Self::header_of(&shm);
        header.refcount.store(0, Ordering::Relaxed);
        header.itemcount.store(0, Ordering::Relaxed);
        header.capacity.store(capacity as u32, Ordering::Relaxed);
        header.refcount.fetch_add(1, Ordering::AcqRel);
        header.ready.store(READY, Ordering::Release);

        debug!(name = shm.name(), size = shm.size(), "created registry segment");

        Self {
            shm,
            capacity,
            detached: AtomicBool::new(false),
        }
    }

    /// Attach to an existing segment. `None` means it vanished or is being
    /// torn down, and the caller should try creating it again.
    fn try_attach(name: &str, capacity: usize, deadline: Instant) -> Result<Option<Self>> {
        let shm = match SharedMemory::open(name) {
            Ok(shm) => shm,
            // Unlinked meanwhile, or the creator has not sized it yet.
            Err(e) if Instant::now() < deadline => {
                debug!(name, error = %e, "segment not yet openable, retrying");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if shm.size() < Self::calc_size(capacity) {
            return Err(Error::SegmentUnavailable(format!(
                "{}: segment is {} bytes, expected {}",
                name,
                shm.size(),
                Self::calc_size(capacity)
            )));
        }

        let header = Self::header_of(&shm);
        while header.ready.load(Ordering::Acquire) != READY {
            if Instant::now() >= deadline {
                return Err(Error::SegmentUnavailable(format!(
                    "{}: segment never became ready",
                    name
                )));
            }
            thread::yield_now();
        }

        let found = header.capacity.load(Ordering::Relaxed) as usize;
        if found != capacity {
            return Err(Error::SegmentUnavailable(format!(
                "{}: capacity mismatch: expected {}, got {}",
                name, capacity, found
            )));
        }

        // A zero refcount means the last holder is unlinking it.
        let joined = header
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n != 0).then(|| n + 1)
            });
        match joined {
            Ok(prev) => {
                debug!(name, refcount = prev + 1, "attached to registry segment");
                Ok(Some(Self {
                    shm,
                    capacity,
                    detached: AtomicBool::new(false),
                }))
            }
            Err(_) => {
                debug!(name, "segment is being torn down, retrying");
                Ok(None)
            }
        }
    }

    fn header_of(shm: &SharedMemory) -> &SegmentHeader {
        unsafe { &*(shm.as_ptr() as *const SegmentHeader) }
    }

    fn header(&self) -> &SegmentHeader {
        Self::header_of(&self.shm)
    }

    /// Give back this attachment. The last attachment removes the name.
    ///
    /// Returns `false` if this segment was already detached. The mapping
    /// stays valid until the `Segment` is dropped.
    pub fn detach(&self) -> bool {
        if self.detached.swap(true, Ordering::AcqRel) {
            return false;
        }

        let prev = self
            .header()
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        debug!(
            name = self.name(),
            refcount = prev.saturating_sub(1),
            "detached from registry segment"
        );

        if prev == 1 {
            match SharedMemory::unlink(self.name()) {
                Ok(()) => debug!(name = self.name(), "registry segment destroyed"),
                Err(e) => warn!(name = self.name(), error = %e, "failed to unlink segment"),
            }
        }
        true
    }

    /// Whether this attachment has been given back
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Get the segment name
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Current number of attachments across all processes
    pub fn refcount(&self) -> u64 {
        self.header().refcount.load(Ordering::Acquire)
    }

    pub fn items(&self) -> LiveItems<'_> {
        LiveItems::new(&self.header().itemcount)
    }

    pub fn table(&self) -> NameTable<'_> {
        let entries = unsafe {
            let ptr = self.shm.as_ptr().add(HEADER_SIZE) as *const Entry;
            std::slice::from_raw_parts(ptr, self.capacity)
        };
        NameTable::new(entries)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.detach();
    }
}
