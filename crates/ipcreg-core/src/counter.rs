//! Live-item counter
//!
//! Counts register calls minus deregister calls, not distinct keys: an
//! overwrite increments it and a deregister of an absent name still
//! decrements it. Its only effect is to signal when the segment should be
//! torn down.

use std::sync::atomic::{AtomicU64, Ordering};

/// Result of a decrement
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decrement {
    /// The counter went from 1 to 0; the caller must tear the segment down
    ReachedZero,
    /// The counter is still positive
    Remaining(u64),
    /// The counter was already 0 and stays there
    AlreadyZero,
}

/// Wrapper over the shared `itemcount` header field
pub struct LiveItems<'a> {
    count: &'a AtomicU64,
}

impl<'a> LiveItems<'a> {
    pub fn new(count: &'a AtomicU64) -> Self {
        Self { count }
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Increment, returning the new value
    pub fn increment(&self) -> u64 {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement, saturating at zero
    pub fn decrement(&self) -> Decrement {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(1) => Decrement::ReachedZero,
            Ok(n) => Decrement::Remaining(n - 1),
            Err(_) => Decrement::AlreadyZero,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrement_to_zero_fires_once() {
        let raw = AtomicU64::new(0);
        let items = LiveItems::new(&raw);
        assert_eq!(items.increment(), 1);
        assert_eq!(items.increment(), 2);
        assert_eq!(items.decrement(), Decrement::Remaining(1));
        assert_eq!(items.decrement(), Decrement::ReachedZero);
        assert_eq!(items.decrement(), Decrement::AlreadyZero);
        assert_eq!(items.get(), 0);
    }

    #[test]
    fn test_concurrent_decrements_fire_once() {
        let raw = AtomicU64::new(64);
        let zeros = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let items = LiveItems::new(&raw);
                        (0..10)
                            .filter(|_| items.decrement() == Decrement::ReachedZero)
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum::<usize>()
        });
        assert_eq!(zeros, 1);
        assert_eq!(raw.load(Ordering::SeqCst), 0);
    }
}
