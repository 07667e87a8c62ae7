//! Lock-free name table stored in shared memory
//!
//! A fixed-capacity open-addressed hash table. Every slot moves through
//! `Empty -> Reserved -> Occupied -> (Reserved ->) Empty`, with every
//! transition out of a published state made by compare-and-swap, so any
//! attached process can insert, overwrite, look up and remove without a
//! shared lock.
//!
//! All slot fields are atomics. Readers copy a slot optimistically and then
//! re-check its state and generation, retrying if a writer claimed the slot in
//! between.

use crate::handle::{IpcMemHandle, IPC_HANDLE_SIZE};
use crate::{Error, Result};
use std::hint::spin_loop;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

/// Number of slots in the table
pub const CAPACITY: usize = 1024;

/// Size of the NUL-padded name buffer, including the terminator
pub const NAME_MAX_LEN: usize = 64;

const NAME_WORDS: usize = NAME_MAX_LEN / 8;
const HANDLE_WORDS: usize = IPC_HANDLE_SIZE / 8;

/// How long to wait on a slot another writer holds in `Reserved`
const SPIN_LIMIT: u32 = 1 << 16;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Slot states
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Empty = 0,
    Occupied = 1,
    Reserved = 2,
}

impl SlotState {
    /// Convert from u32
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(SlotState::Empty),
            1 => Some(SlotState::Occupied),
            2 => Some(SlotState::Reserved),
            _ => None,
        }
    }
}

/// A table key: the name truncated to `NAME_MAX_LEN - 1` bytes and NUL-padded.
///
/// Names that share their first 63 bytes map to the same key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Key {
    words: [u64; NAME_WORDS],
    hash: u64,
}

impl Key {
    pub fn new(name: &str) -> Self {
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_MAX_LEN - 1);

        let mut buf = [0u8; NAME_MAX_LEN];
        buf[..len].copy_from_slice(&bytes[..len]);

        let mut hash = FNV_OFFSET;
        for &b in &buf[..len] {
            hash ^= b as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }

        let mut words = [0u64; NAME_WORDS];
        for (word, chunk) in words.iter_mut().zip(buf.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_ne_bytes(raw);
        }

        Self { words, hash }
    }

    /// Whether the name did not fit and was cut short
    pub fn is_truncated(name: &str) -> bool {
        name.len() > NAME_MAX_LEN - 1
    }

    fn home(&self, capacity: usize) -> usize {
        (self.hash % capacity as u64) as usize
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buf = Vec::with_capacity(NAME_MAX_LEN);
        for w in &self.words {
            buf.extend_from_slice(&w.to_ne_bytes());
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        write!(f, "Key({:?})", String::from_utf8_lossy(&buf[..end]))
    }
}

/// One table slot, laid out identically in every attached process
#[repr(C)]
pub struct Entry {
    /// `SlotState` as u32
    state: AtomicU32,
    /// Bumped on every publish
    generation: AtomicU32,
    name: [AtomicU64; NAME_WORDS],
    handle: [AtomicU64; HANDLE_WORDS],
    offset: AtomicU64,
    size: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<Entry>() == 152);

impl Default for Entry {
    fn default() -> Self {
        Self {
            state: AtomicU32::new(SlotState::Empty as u32),
            generation: AtomicU32::new(0),
            name: std::array::from_fn(|_| AtomicU64::new(0)),
            handle: std::array::from_fn(|_| AtomicU64::new(0)),
            offset: AtomicU64::new(0),
            size: AtomicU64::new(0),
        }
    }
}

impl Entry {
    /// Size of Entry in bytes
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Current state. Unknown values read as `Reserved` so nobody touches them.
    pub fn state(&self) -> SlotState {
        SlotState::from_u32(self.state.load(Ordering::Acquire)).unwrap_or(SlotState::Reserved)
    }

    fn key_matches(&self, key: &Key) -> bool {
        self.name
            .iter()
            .zip(&key.words)
            .all(|(slot, word)| slot.load(Ordering::Relaxed) == *word)
    }

    /// Exclusive claim of a slot in state `from`
    fn try_claim(&self, from: SlotState) -> bool {
        let claimed = self
            .state
            .compare_exchange(
                from as u32,
                SlotState::Reserved as u32,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok();
        if claimed {
            // Field writes must not become visible before the claim.
            fence(Ordering::Release);
        }
        claimed
    }

    fn write_key(&self, key: &Key) {
        for (slot, word) in self.name.iter().zip(&key.words) {
            slot.store(*word, Ordering::Relaxed);
        }
    }

    fn write_handle(&self, handle: &IpcMemHandle) {
        for (slot, chunk) in self.handle.iter().zip(handle.handle.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            slot.store(u64::from_ne_bytes(raw), Ordering::Relaxed);
        }
        self.offset.store(handle.offset, Ordering::Relaxed);
        self.size.store(handle.size, Ordering::Relaxed);
    }

    fn read_handle(&self) -> IpcMemHandle {
        let mut handle = IpcMemHandle::default();
        for (slot, chunk) in self.handle.iter().zip(handle.handle.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&slot.load(Ordering::Relaxed).to_ne_bytes());
        }
        handle.offset = self.offset.load(Ordering::Relaxed);
        handle.size = self.size.load(Ordering::Relaxed);
        handle
    }

    /// Publish a claimed slot as Occupied
    fn publish(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        self.state.store(SlotState::Occupied as u32, Ordering::Release);
    }

    /// Give back a claimed slot without having changed it
    fn restore(&self) {
        self.state.store(SlotState::Occupied as u32, Ordering::Release);
    }

    fn clear(&self) {
        self.state.store(SlotState::Empty as u32, Ordering::Release);
    }

    /// Copy the handle if this slot holds `key`
    fn snapshot(&self, key: &Key) -> Snapshot {
        let generation = self.generation.load(Ordering::Acquire);
        match self.state() {
            SlotState::Empty => return Snapshot::Miss,
            SlotState::Reserved => {
                return if self.key_matches(key) {
                    Snapshot::Busy
                } else {
                    Snapshot::Miss
                };
            }
            SlotState::Occupied => {}
        }

        let matches = self.key_matches(key);
        let handle = self.read_handle();

        fence(Ordering::Acquire);
        let stable = self.state.load(Ordering::Relaxed) == SlotState::Occupied as u32
            && self.generation.load(Ordering::Relaxed) == generation;

        match (stable, matches) {
            (true, true) => Snapshot::Hit(handle),
            (true, false) => Snapshot::Miss,
            (false, _) => Snapshot::Busy,
        }
    }
}

enum Snapshot {
    Hit(IpcMemHandle),
    Miss,
    Busy,
}

/// Outcome of a successful insert
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inserted {
    /// An empty slot was claimed
    New(usize),
    /// The key was already present and its handle replaced
    Overwritten(usize),
}

/// View over a table of entries (in shared memory or on the heap)
pub struct NameTable<'a> {
    entries: &'a [Entry],
}

impl<'a> NameTable<'a> {
    pub fn new(entries: &'a [Entry]) -> Self {
        Self { entries }
    }

    /// Slot indices in probe order for `key`, each visited once
    fn probe(&self, key: &Key) -> impl Iterator<Item = (usize, &'a Entry)> + 'a {
        let entries = self.entries;
        let capacity = entries.len();
        let home = if capacity == 0 { 0 } else { key.home(capacity) };
        (0..capacity).map(move |i| {
            let idx = (home + i) % capacity;
            (idx, &entries[idx])
        })
    }

    /// Claim the slot if it holds `key`, waiting out other writers
    fn claim_matching(entry: &Entry, key: &Key) -> bool {
        let mut spins = 0;
        loop {
            match entry.state() {
                SlotState::Empty => return false,
                SlotState::Occupied => {
                    if !entry.key_matches(key) {
                        return false;
                    }
                    if entry.try_claim(SlotState::Occupied) {
                        if entry.key_matches(key) {
                            return true;
                        }
                        // Slot was recycled under another key between the check and the claim.
                        entry.restore();
                        return false;
                    }
                }
                SlotState::Reserved => {
                    if !entry.key_matches(key) {
                        return false;
                    }
                }
            }
            spins += 1;
            if spins > SPIN_LIMIT {
                return false;
            }
            spin_loop();
        }
    }

    /// Insert `handle` under `key`, overwriting an existing entry for the same key
    pub fn insert(&self, key: &Key, handle: &IpcMemHandle) -> Result<Inserted> {
        for (idx, entry) in self.probe(key) {
            if Self::claim_matching(entry, key) {
                entry.write_handle(handle);
                entry.publish();
                return Ok(Inserted::Overwritten(idx));
            }
        }

        for (idx, entry) in self.probe(key) {
            if entry.try_claim(SlotState::Empty) {
                entry.write_key(key);
                entry.write_handle(handle);
                entry.publish();
                return Ok(Inserted::New(idx));
            }
        }

        Err(Error::TableFull)
    }

    /// Remove `key`, returning the slot it occupied
    pub fn remove(&self, key: &Key) -> Option<usize> {
        for (idx, entry) in self.probe(key) {
            if Self::claim_matching(entry, key) {
                entry.clear();
                return Some(idx);
            }
        }
        None
    }

    /// Single probe pass for `key`
    pub fn get(&self, key: &Key) -> Option<IpcMemHandle> {
        for (_, entry) in self.probe(key) {
            let mut spins = 0;
            loop {
                match entry.snapshot(key) {
                    Snapshot::Hit(handle) => return Some(handle),
                    Snapshot::Miss => break,
                    Snapshot::Busy => {
                        spins += 1;
                        if spins > SPIN_LIMIT {
                            break;
                        }
                        spin_loop();
                    }
                }
            }
        }
        None
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    /// Number of slots currently Occupied
    pub fn occupied(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state() == SlotState::Occupied)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn entries(n: usize) -> Vec<Entry> {
        (0..n).map(|_| Entry::default()).collect()
    }

    fn handle(tag: u8, offset: u64, size: u64) -> IpcMemHandle {
        IpcMemHandle {
            handle: [tag; IPC_HANDLE_SIZE],
            offset,
            size,
        }
    }

    #[test]
    fn test_entry_size() {
        // Ensure struct size is stable for cross-process compatibility
        assert_eq!(Entry::SIZE, 4 + 4 + NAME_MAX_LEN + IPC_HANDLE_SIZE + 16);
    }

    #[test]
    fn test_insert_get_remove() {
        let slots = entries(16);
        let table = NameTable::new(&slots);
        let key = Key::new("tensor_a");

        assert!(table.get(&key).is_none());
        assert!(matches!(table.insert(&key, &handle(1, 8, 64)), Ok(Inserted::New(_))));
        assert_eq!(table.get(&key), Some(handle(1, 8, 64)));
        assert_eq!(table.occupied(), 1);

        assert!(table.remove(&key).is_some());
        assert!(table.get(&key).is_none());
        assert!(table.remove(&key).is_none());
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn test_overwrite_keeps_single_slot() {
        let slots = entries(16);
        let table = NameTable::new(&slots);
        let key = Key::new("k");

        let first = table.insert(&key, &handle(1, 0, 10)).unwrap();
        let second = table.insert(&key, &handle(2, 4, 20)).unwrap();
        let Inserted::New(idx) = first else {
            panic!("first insert should claim a new slot");
        };
        assert_eq!(second, Inserted::Overwritten(idx));
        assert_eq!(table.get(&key), Some(handle(2, 4, 20)));
        assert_eq!(table.occupied(), 1);
    }

    #[test]
    fn test_overwrite_found_past_hole() {
        let slots = entries(4);
        let table = NameTable::new(&slots);
        let names = ["a", "b", "c", "d"];
        for (i, name) in names.iter().enumerate() {
            table.insert(&Key::new(name), &handle(i as u8, 0, 1)).unwrap();
        }
        // Punch a hole, then overwrite every key: none may land in the hole.
        table.remove(&Key::new("a")).unwrap();
        for name in &names[1..] {
            assert!(matches!(
                table.insert(&Key::new(name), &handle(9, 0, 2)),
                Ok(Inserted::Overwritten(_))
            ));
        }
        assert_eq!(table.occupied(), 3);
    }

    #[test]
    fn test_full_table() {
        let slots = entries(8);
        let table = NameTable::new(&slots);
        for i in 0..8 {
            table.insert(&Key::new(&format!("key{}", i)), &handle(0, 0, 1)).unwrap();
        }
        assert!(matches!(
            table.insert(&Key::new("one_more"), &handle(0, 0, 1)),
            Err(Error::TableFull)
        ));
        // Existing keys can still be overwritten when full.
        assert!(table.insert(&Key::new("key3"), &handle(7, 0, 1)).is_ok());
    }

    #[test]
    fn test_long_names_truncate_and_merge() {
        let prefix = "x".repeat(NAME_MAX_LEN - 1);
        let a = format!("{}alpha", prefix);
        let b = format!("{}beta", prefix);
        assert!(Key::is_truncated(&a));
        assert!(!Key::is_truncated(&prefix));
        assert_eq!(Key::new(&a), Key::new(&b));

        let slots = entries(8);
        let table = NameTable::new(&slots);
        table.insert(&Key::new(&a), &handle(1, 0, 1)).unwrap();
        assert_eq!(table.get(&Key::new(&b)), Some(handle(1, 0, 1)));
    }

    #[test]
    fn test_reserved_slot_is_invisible() {
        let slots = entries(4);
        let table = NameTable::new(&slots);
        let key = Key::new("pending");
        let idx = key.home(4);

        assert!(slots[idx].try_claim(SlotState::Empty));
        assert!(table.get(&key).is_none());
        // A concurrent insert of another key skips the reserved slot.
        let other = table.insert(&Key::new("other"), &handle(3, 0, 1)).unwrap();
        assert_ne!(other, Inserted::New(idx));
    }

    #[test]
    fn test_concurrent_distinct_inserts() {
        let slots: Arc<Vec<Entry>> = Arc::new(entries(256));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let slots = Arc::clone(&slots);
                thread::spawn(move || {
                    let table = NameTable::new(&slots);
                    for i in 0..32 {
                        let key = Key::new(&format!("t{}_{}", t, i));
                        table.insert(&key, &handle(t as u8, i, 1)).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let table = NameTable::new(&slots);
        assert_eq!(table.occupied(), 256);
        for t in 0..8u8 {
            for i in 0..32 {
                let got = table.get(&Key::new(&format!("t{}_{}", t, i))).unwrap();
                assert_eq!(got, handle(t, i, 1));
            }
        }
    }

    #[test]
    fn test_readers_never_see_torn_handles() {
        let slots: Arc<Vec<Entry>> = Arc::new(entries(16));
        let key = Key::new("hot");
        NameTable::new(&slots).insert(&key, &handle(0, 0, 0)).unwrap();

        let writer = {
            let slots = Arc::clone(&slots);
            thread::spawn(move || {
                let table = NameTable::new(&slots);
                for i in 1..=2000u64 {
                    table.insert(&key, &handle(i as u8, i, i)).unwrap();
                }
            })
        };
        let reader = {
            let slots = Arc::clone(&slots);
            thread::spawn(move || {
                let table = NameTable::new(&slots);
                for _ in 0..2000 {
                    if let Some(h) = table.get(&key) {
                        assert_eq!(h.offset, h.size);
                        assert!(h.handle.iter().all(|&b| b == h.offset as u8));
                    }
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(NameTable::new(&slots).occupied(), 1);
    }

    #[test]
    fn test_concurrent_remove_only_one_wins() {
        let slots: Arc<Vec<Entry>> = Arc::new(entries(8));
        let key = Key::new("shared");
        NameTable::new(&slots).insert(&key, &handle(1, 0, 1)).unwrap();

        let removers: Vec<_> = (0..4)
            .map(|_| {
                let slots = Arc::clone(&slots);
                thread::spawn(move || NameTable::new(&slots).remove(&key).is_some())
            })
            .collect();
        let wins = removers
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);
    }
}
