//! Name registry for GPU IPC handles

use crate::cache::SegmentCache;
use crate::config::RegistryConfig;
use crate::counter::Decrement;
use crate::handle::{split_aligned, IpcMemHandle};
use crate::runtime::{default_runtime, IpcRuntime};
use crate::segment::Segment;
use crate::table::{Inserted, Key, CAPACITY};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Result of [`Registry::check_exists`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Presence {
    /// The segment could not be created or attached
    Unavailable = 1,
    Found = 2,
    NotFound = 3,
}

/// Snapshot of the shared counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStats {
    /// Attachments across all processes
    pub refcount: u64,
    /// Live-item counter
    pub itemcount: u64,
    /// Slots currently holding a key
    pub occupied: usize,
}

/// Registry of named GPU IPC handles shared by every process on the host
pub struct Registry {
    config: RegistryConfig,
    runtime: Arc<dyn IpcRuntime>,
    cache: SegmentCache,
    /// Shared by register and deregister, exclusive for teardown
    lifecycle: RwLock<()>,
}

impl Registry {
    /// Create a registry over the segment named in `config`
    pub fn new(config: RegistryConfig, runtime: Arc<dyn IpcRuntime>) -> Self {
        Self {
            config,
            runtime,
            cache: SegmentCache::new(),
            lifecycle: RwLock::new(()),
        }
    }

    /// The process-wide registry with the default configuration
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(|| Registry::new(RegistryConfig::default(), default_runtime()))
    }

    /// Get configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// This process's attachment, created on first use
    pub fn segment(&self) -> Result<Arc<Segment>> {
        self.cache.get_or_attach(|| {
            Segment::open_or_attach(&self.config.shm_name, CAPACITY, self.config.ready_timeout)
        })
    }

    /// Register the allocation at `ptr` under `name`.
    ///
    /// Registering a name again replaces its handle. Each call must be
    /// matched by exactly one [`Registry::deregister`].
    pub fn register(&self, ptr: u64, size: u64, name: &str) -> Result<()> {
        let (base, offset) = split_aligned(ptr);
        let handle = IpcMemHandle {
            handle: self.runtime.get_ipc_handle(base)?,
            offset,
            size,
        };

        if Key::is_truncated(name) {
            debug!(name, "name exceeds slot length and is truncated");
        }
        let key = Key::new(name);

        // Publish and count under the shared lock so a local teardown
        // cannot detach the segment in between.
        let _lifecycle = self.lifecycle.read();
        let segment = self.segment()?;
        let inserted = match segment.table().insert(&key, &handle) {
            Ok(inserted) => inserted,
            Err(e) => {
                debug!(name, "registry table full");
                return Err(e);
            }
        };
        let items = segment.items().increment();
        match inserted {
            Inserted::New(slot) => trace!(name, slot, size, offset, items, "registered"),
            Inserted::Overwritten(slot) => trace!(name, slot, size, offset, items, "overwrote"),
        }
        Ok(())
    }

    /// Remove `name`.
    ///
    /// The live-item counter is decremented whether or not the name was
    /// present; when it reaches zero this process detaches from the segment.
    pub fn deregister(&self, name: &str) -> Result<()> {
        let (segment, removed, decrement) = {
            let _lifecycle = self.lifecycle.read();
            let segment = self.segment()?;
            let removed = segment.table().remove(&Key::new(name));
            let decrement = segment.items().decrement();
            (segment, removed, decrement)
        };

        match decrement {
            Decrement::ReachedZero => self.teardown(&segment),
            Decrement::Remaining(_) => {}
            Decrement::AlreadyZero => warn!(name, "deregister with live-item counter at zero"),
        }

        match removed {
            Some(slot) => {
                trace!(name, slot, "deregistered");
                Ok(())
            }
            None => {
                debug!(name, "deregister of unknown name");
                Err(Error::NotFound)
            }
        }
    }

    fn teardown(&self, segment: &Arc<Segment>) {
        let _lifecycle = self.lifecycle.write();
        // A register may have landed between the decrement and this lock.
        if segment.is_detached() || segment.items().get() != 0 {
            debug!(name = segment.name(), "teardown skipped, segment back in use");
            return;
        }
        self.cache.clear_if(segment);
        segment.detach();
        debug!(name = segment.name(), "last item removed, detached");
    }

    /// Single probe pass for `name`
    pub fn lookup_once(&self, name: &str) -> Result<IpcMemHandle> {
        let segment = self.segment()?;
        segment.table().get(&Key::new(name)).ok_or(Error::NotFound)
    }

    /// Wait until `name` is registered, polling forever
    pub fn lookup_blocking(&self, name: &str) -> Result<IpcMemHandle> {
        self.poll(name, None)
    }

    /// Wait until `name` is registered or `timeout` elapses
    pub fn lookup_timeout(&self, name: &str, timeout: Duration) -> Result<IpcMemHandle> {
        self.poll(name, Some(Instant::now() + timeout))
    }

    fn poll(&self, name: &str, deadline: Option<Instant>) -> Result<IpcMemHandle> {
        let key = Key::new(name);
        loop {
            // A local teardown clears the cache, so fetch per pass.
            let segment = self.segment()?;
            if let Some(handle) = segment.table().get(&key) {
                return Ok(handle);
            }
            let mut wait = self.config.poll_interval;
            if let Some(deadline) = deadline {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(Error::TimedOut);
                }
                wait = wait.min(left);
            }
            thread::sleep(wait);
        }
    }

    /// Whether `name` is registered
    pub fn check_exists(&self, name: &str) -> Presence {
        match self.segment() {
            Ok(segment) if segment.table().contains(&Key::new(name)) => Presence::Found,
            Ok(_) => Presence::NotFound,
            Err(e) => {
                debug!(error = %e, "registry segment unavailable");
                Presence::Unavailable
            }
        }
    }

    /// Read the shared counters
    pub fn stats(&self) -> Result<SegmentStats> {
        let segment = self.segment()?;
        Ok(SegmentStats {
            refcount: segment.refcount(),
            itemcount: segment.items().get(),
            occupied: segment.table().occupied(),
        })
    }
}
