//! Process-local segment cache
//!
//! Holds at most one attachment per registry. Installation is a
//! compare-and-swap from null. A cleared segment is handed to the epoch
//! collector, so readers that loaded it just before the clear can still
//! take their reference, and clearing never waits on them.

use crate::segment::Segment;
use crate::Result;
use crossbeam_epoch::{self as epoch, Atomic, Owned};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct SegmentCache {
    /// The installed segment, or null
    current: Atomic<Arc<Segment>>,
}

impl Default for SegmentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentCache {
    pub fn new() -> Self {
        Self {
            current: Atomic::null(),
        }
    }

    /// The installed segment, if any
    pub fn get(&self) -> Option<Arc<Segment>> {
        let guard = epoch::pin();
        let shared = self.current.load(Ordering::Acquire, &guard);
        // Safety: a non-null pointer is only destroyed through the
        // collector, after every guard that could have loaded it is gone.
        unsafe { shared.as_ref() }.map(Arc::clone)
    }

    /// Return the installed segment, attaching and installing one if needed
    pub fn get_or_attach<F>(&self, mut attach: F) -> Result<Arc<Segment>>
    where
        F: FnMut() -> Result<Segment>,
    {
        loop {
            if let Some(segment) = self.get() {
                return Ok(segment);
            }

            let fresh = Arc::new(attach()?);
            let guard = epoch::pin();
            match self.current.compare_exchange(
                epoch::Shared::null(),
                Owned::new(Arc::clone(&fresh)),
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            ) {
                Ok(_) => return Ok(fresh),
                // Lost to another thread; our attachment is redundant and
                // is released when `fresh` and the rejected box drop.
                Err(_) => tracing::trace!("segment cache lost install race"),
            }
        }
    }

    /// Clear the cache if it holds `segment`
    pub fn clear_if(&self, segment: &Arc<Segment>) -> bool {
        let guard = epoch::pin();
        let shared = self.current.load(Ordering::Acquire, &guard);
        match unsafe { shared.as_ref() } {
            Some(cached) if Arc::ptr_eq(cached, segment) => {}
            _ => return false,
        }
        if self
            .current
            .compare_exchange(
                shared,
                epoch::Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            )
            .is_err()
        {
            return false;
        }

        // Safety: unpublished above; late readers are covered by the epoch.
        unsafe { guard.defer_destroy(shared) };
        guard.flush();
        true
    }
}

impl Drop for SegmentCache {
    fn drop(&mut self) {
        // Safety: `&mut self` rules out concurrent readers.
        unsafe {
            let shared = self
                .current
                .load(Ordering::Relaxed, epoch::unprotected());
            if !shared.is_null() {
                drop(shared.into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::CAPACITY;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn unique_name() -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/ipcreg_cache_{}_{}", std::process::id(), ts)
    }

    fn attach(name: &str) -> Result<Segment> {
        Segment::open_or_attach(name, CAPACITY, Duration::from_secs(2))
    }

    #[test]
    fn test_single_mapping_under_contention() {
        let name = unique_name();
        let cache = SegmentCache::new();

        let segments: Vec<Arc<Segment>> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| cache.get_or_attach(|| attach(&name)).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let first = Arc::as_ptr(&segments[0]);
        assert!(segments.iter().all(|s| Arc::as_ptr(s) == first));
        // Losers gave their attachments back.
        assert_eq!(segments[0].refcount(), 1);
    }

    #[test]
    fn test_clear_if_only_matching() {
        let name = unique_name();
        let cache = SegmentCache::new();
        let installed = cache.get_or_attach(|| attach(&name)).unwrap();
        let other = Arc::new(attach(&name).unwrap());

        assert!(!cache.clear_if(&other));
        assert!(cache.get().is_some());
        assert!(cache.clear_if(&installed));
        assert!(cache.get().is_none());
        assert!(!cache.clear_if(&installed));
    }

    #[test]
    fn test_clear_completes_under_constant_reads() {
        let name = unique_name();
        let cache = SegmentCache::new();
        let installed = cache.get_or_attach(|| attach(&name)).unwrap();
        let stop = AtomicBool::new(false);

        let (cleared, empty) = thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    while !stop.load(Ordering::Relaxed) {
                        if let Some(segment) = cache.get() {
                            assert!(Arc::ptr_eq(&segment, &installed));
                        }
                    }
                });
            }
            thread::sleep(Duration::from_millis(20));
            let cleared = cache.clear_if(&installed);
            let empty = cache.get().is_none();
            stop.store(true, Ordering::Relaxed);
            (cleared, empty)
        });

        assert!(cleared);
        assert!(empty);
        assert!(installed.detach());
    }
}
