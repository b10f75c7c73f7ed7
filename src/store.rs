//! Store: per-thread open-addressing table keyed by handle identity.
//!
//! Slots are probed linearly one pair at a time from `hash.bucket(mask)`.
//! Keys are weak references to their handles, so a handle dropped on any
//! thread leaves a cleared key behind. Cleared keys read as absent and are
//! turned into tombstones by the incremental sweep in `clean_up`, by
//! `rehash`, or by `fork`.
//!
//! Values displaced by a mutation are not dropped in place. They are parked
//! on an eviction list which the owner drains once it no longer holds the
//! store, so value destructors never observe a store mid-operation.

use crate::error::InitError;
use crate::hash::KeyHash;
use core::mem;
use core::sync::atomic::{AtomicU64, Ordering};
use std::any::Any;
use std::sync::{Arc, Weak};

/// Pairs in a freshly created store.
pub(crate) const INITIAL_CAPACITY: usize = 16;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Type-erased view of a handle, as seen through a table key.
pub(crate) trait Key: Send + Sync + 'static {
    /// Value the child thread starts with, derived from the parent's value.
    fn child_value(&self, parent: &dyn Any) -> Result<Box<dyn Any + Send>, InitError>;
}

/// Table key: weak reference to a handle plus its cached hash.
#[derive(Clone)]
pub(crate) struct SlotKey {
    weak: Weak<dyn Key>,
    hash: KeyHash,
}

impl SlotKey {
    pub(crate) fn new(weak: Weak<dyn Key>, hash: KeyHash) -> Self {
        Self { weak, hash }
    }

    #[inline]
    fn same(&self, other: &SlotKey) -> bool {
        Weak::ptr_eq(&self.weak, &other.weak)
    }

    /// True once the handle behind this key has been dropped.
    #[inline]
    pub(crate) fn is_cleared(&self) -> bool {
        self.weak.strong_count() == 0
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<dyn Key>> {
        self.weak.upgrade()
    }
}

enum Slot<V> {
    Empty,
    Tombstone,
    Live(SlotKey, V),
}

/// Result of the full probe taken after the fast single-slot check missed.
pub(crate) enum Lookup<'a, V> {
    Hit(&'a V),
    Miss(Vacancy),
}

/// Where a missing key would be installed, valid only while the store is
/// unchanged.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Vacancy {
    index: usize,
    store_id: u64,
    stamp: u64,
}

/// Point-in-time counters of a store, for diagnostics and tests.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StoreStats {
    /// Slot pairs in the table; always a power of two.
    pub capacity: usize,
    /// Live pairs, including ones whose handle was dropped but not yet swept.
    pub size: usize,
    pub tombstones: usize,
    /// Load (`size + tombstones`) at which the next mutation rehashes.
    pub max_load: usize,
    /// Rehashes performed since the store was created.
    pub rehashes: u64,
}

pub(crate) struct Store<V> {
    table: Box<[Slot<V>]>,
    mask: usize,
    size: usize,
    tombstones: usize,
    max_load: usize,
    cursor: usize,
    id: u64,
    // Bumped by every structural change; a `Vacancy` is stale once it moves.
    stamp: u64,
    rehashes: u64,
    evicted: Vec<V>,
}

fn empty_table<V>(capacity: usize) -> Box<[Slot<V>]> {
    (0..capacity).map(|_| Slot::Empty).collect()
}

#[inline]
fn max_load_for(capacity: usize) -> usize {
    capacity * 2 / 3
}

impl<V> Store<V> {
    pub(crate) fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity >= INITIAL_CAPACITY);
        Self {
            table: empty_table(capacity),
            mask: capacity - 1,
            size: 0,
            tombstones: 0,
            max_load: max_load_for(capacity),
            cursor: 0,
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            stamp: 0,
            rehashes: 0,
            evicted: Vec::new(),
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.table.len()
    }

    #[inline]
    fn next(&self, index: usize) -> usize {
        (index + 1) & self.mask
    }

    pub(crate) fn len(&self) -> usize {
        self.size
    }

    pub(crate) fn stats(&self) -> StoreStats {
        StoreStats {
            capacity: self.capacity(),
            size: self.size,
            tombstones: self.tombstones,
            max_load: self.max_load,
            rehashes: self.rehashes,
        }
    }

    /// Values displaced since the last call; drop them outside the store.
    pub(crate) fn take_evicted(&mut self) -> Vec<V> {
        mem::take(&mut self.evicted)
    }

    /// Single probe at the key's own bucket.
    #[inline]
    pub(crate) fn get(&self, key: &SlotKey) -> Option<&V> {
        match &self.table[key.hash.bucket(self.mask)] {
            Slot::Live(k, v) if k.same(key) => Some(v),
            _ => None,
        }
    }

    /// Full probe for `key`. On a miss, reports where it would be installed:
    /// the first tombstone on the probe path, else the terminating empty slot.
    pub(crate) fn lookup_after_miss(&self, key: &SlotKey) -> Lookup<'_, V> {
        let mut first_tombstone = None;
        let mut index = key.hash.bucket(self.mask);
        loop {
            match &self.table[index] {
                Slot::Live(k, v) if k.same(key) => return Lookup::Hit(v),
                Slot::Empty => {
                    return Lookup::Miss(Vacancy {
                        index: first_tombstone.unwrap_or(index),
                        store_id: self.id,
                        stamp: self.stamp,
                    })
                }
                Slot::Tombstone if first_tombstone.is_none() => first_tombstone = Some(index),
                _ => {}
            }
            index = self.next(index);
        }
    }

    /// Install a value computed after `lookup_after_miss` reported `vacancy`.
    /// Falls back to `put` if the store changed in between.
    pub(crate) fn install(&mut self, key: &SlotKey, value: V, vacancy: Vacancy) {
        if vacancy.store_id != self.id || vacancy.stamp != self.stamp {
            self.put(key.clone(), value);
            return;
        }
        let reused = match &self.table[vacancy.index] {
            Slot::Tombstone => true,
            Slot::Empty => false,
            Slot::Live(..) => unreachable!("vacancy points at a live slot"),
        };
        self.table[vacancy.index] = Slot::Live(key.clone(), value);
        self.size += 1;
        self.stamp += 1;
        if reused {
            self.tombstones -= 1;
        } else {
            // Load grew by one; this restores the load bound.
            self.clean_up();
        }
    }

    /// Insert or overwrite the value for `key`.
    pub(crate) fn put(&mut self, key: SlotKey, value: V) {
        self.clean_up();

        let mut first_tombstone = None;
        let mut index = key.hash.bucket(self.mask);
        loop {
            match &mut self.table[index] {
                Slot::Live(k, v) if k.same(&key) => {
                    let old = mem::replace(v, value);
                    self.evicted.push(old);
                    return;
                }
                Slot::Empty => {
                    let target = match first_tombstone {
                        Some(t) => {
                            self.tombstones -= 1;
                            t
                        }
                        None => index,
                    };
                    self.table[target] = Slot::Live(key, value);
                    self.size += 1;
                    self.stamp += 1;
                    return;
                }
                Slot::Tombstone if first_tombstone.is_none() => first_tombstone = Some(index),
                _ => {}
            }
            index = self.next(index);
        }
    }

    /// Tombstone the pair for `key`. Returns false if there was none.
    pub(crate) fn remove(&mut self, key: &SlotKey) -> bool {
        self.clean_up();

        let mut index = key.hash.bucket(self.mask);
        loop {
            match &self.table[index] {
                Slot::Live(k, _) if k.same(key) => {
                    self.bury(index);
                    return true;
                }
                Slot::Empty => return false,
                _ => {}
            }
            index = self.next(index);
        }
    }

    fn bury(&mut self, index: usize) {
        match mem::replace(&mut self.table[index], Slot::Tombstone) {
            Slot::Live(_, value) => self.evicted.push(value),
            _ => unreachable!("only live slots are buried"),
        }
        self.tombstones += 1;
        self.size -= 1;
        self.stamp += 1;
    }

    /// Rehash if due, otherwise sweep `log2(capacity)` slots for cleared keys.
    fn clean_up(&mut self) {
        if self.rehash() || self.size == 0 {
            return;
        }

        let mut index = self.cursor;
        let mut reclaimed = 0usize;
        for _ in 0..self.capacity().trailing_zeros() {
            if matches!(&self.table[index], Slot::Live(k, _) if k.is_cleared()) {
                self.bury(index);
                reclaimed += 1;
            }
            index = self.next(index);
        }
        self.cursor = index;

        if reclaimed > 0 {
            tracing::trace!(reclaimed, cursor = index, "swept cleared thread-local keys");
        }
    }

    /// Rebuild the table once load reaches `max_load`. Grows only when more
    /// than half of the pairs are live; otherwise the capacity is recycled.
    fn rehash(&mut self) -> bool {
        if self.size + self.tombstones < self.max_load {
            return false;
        }

        let old_capacity = self.capacity();
        let capacity = if self.size > old_capacity / 2 {
            old_capacity * 2
        } else {
            old_capacity
        };
        let old = mem::replace(&mut self.table, empty_table(capacity));
        self.mask = capacity - 1;
        self.max_load = max_load_for(capacity);
        self.tombstones = 0;
        self.cursor = 0;
        self.stamp += 1;
        self.rehashes += 1;

        let mut dropped = 0usize;
        for slot in old.into_vec() {
            if let Slot::Live(key, value) = slot {
                if key.is_cleared() {
                    self.size -= 1;
                    self.evicted.push(value);
                    dropped += 1;
                } else {
                    self.add(key, value);
                }
            }
        }

        tracing::debug!(
            old_capacity,
            capacity,
            live = self.size,
            dropped,
            "rehashed thread-local store"
        );
        true
    }

    /// Insert into a table known to hold neither `key` nor tombstones.
    fn add(&mut self, key: SlotKey, value: V) {
        let mut index = key.hash.bucket(self.mask);
        while !matches!(self.table[index], Slot::Empty) {
            index = self.next(index);
        }
        self.table[index] = Slot::Live(key, value);
    }

    /// Copy the table layout and counters into a new store, cloning live
    /// values. Cleared keys are buried in both copies first.
    pub(crate) fn fork(&mut self) -> Store<V>
    where
        V: Clone,
    {
        let mut table = Vec::with_capacity(self.capacity());
        for index in 0..self.capacity() {
            let slot = match &self.table[index] {
                Slot::Empty => Slot::Empty,
                Slot::Tombstone => Slot::Tombstone,
                Slot::Live(k, _) if k.is_cleared() => {
                    self.bury(index);
                    Slot::Tombstone
                }
                Slot::Live(k, v) => Slot::Live(k.clone(), v.clone()),
            };
            table.push(slot);
        }

        Store {
            table: table.into_boxed_slice(),
            mask: self.mask,
            size: self.size,
            tombstones: self.tombstones,
            max_load: self.max_load,
            cursor: self.cursor,
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            stamp: 0,
            rehashes: 0,
            evicted: Vec::new(),
        }
    }

    /// Convert every live value, keeping the layout. `f` returning `None`
    /// buries the pair; the first error aborts the conversion.
    pub(crate) fn try_map<U, E, F>(self, mut f: F) -> Result<Store<U>, E>
    where
        F: FnMut(&SlotKey, V) -> Result<Option<U>, E>,
    {
        let mut size = self.size;
        let mut tombstones = self.tombstones;
        let mut table = Vec::with_capacity(self.table.len());
        for slot in self.table.into_vec() {
            let slot = match slot {
                Slot::Empty => Slot::Empty,
                Slot::Tombstone => Slot::Tombstone,
                Slot::Live(key, value) => match f(&key, value)? {
                    Some(mapped) => Slot::Live(key, mapped),
                    None => {
                        size -= 1;
                        tombstones += 1;
                        Slot::Tombstone
                    }
                },
            };
            table.push(slot);
        }

        Ok(Store {
            table: table.into_boxed_slice(),
            mask: self.mask,
            size,
            tombstones,
            max_load: self.max_load,
            cursor: self.cursor,
            id: self.id,
            stamp: self.stamp + 1,
            rehashes: self.rehashes,
            evicted: Vec::new(),
        })
    }

    /// Panics if any structural invariant is broken.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let capacity = self.capacity();
        assert!(capacity.is_power_of_two() && capacity >= INITIAL_CAPACITY);
        assert_eq!(self.mask, capacity - 1);
        assert_eq!(self.max_load, max_load_for(capacity));
        assert!(
            self.size + self.tombstones <= self.max_load,
            "load {} + {} exceeds {}",
            self.size,
            self.tombstones,
            self.max_load
        );

        let mut live = 0;
        let mut dead = 0;
        for (index, slot) in self.table.iter().enumerate() {
            match slot {
                Slot::Empty => {}
                Slot::Tombstone => dead += 1,
                Slot::Live(key, _) => {
                    live += 1;
                    // Reachable from its bucket without crossing an empty slot,
                    // and no duplicate of the key earlier on that path.
                    let mut i = key.hash.bucket(self.mask);
                    while i != index {
                        match &self.table[i] {
                            Slot::Empty => panic!("slot {index} unreachable from its bucket"),
                            Slot::Live(other, _) if other.same(key) => {
                                panic!("duplicate live key at {i} and {index}")
                            }
                            _ => {}
                        }
                        i = self.next(i);
                    }
                }
            }
        }
        assert_eq!(live, self.size, "size counter out of sync");
        assert_eq!(dead, self.tombstones, "tombstone counter out of sync");
    }

    #[cfg(test)]
    pub(crate) fn slot_is_tombstone(&self, index: usize) -> bool {
        matches!(self.table[index], Slot::Tombstone)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Minimal handles for exercising the table directly.

    use super::*;

    pub(crate) struct TestKey {
        pub(crate) bump: i32,
    }

    impl Key for TestKey {
        fn child_value(&self, parent: &dyn Any) -> Result<Box<dyn Any + Send>, InitError> {
            match parent.downcast_ref::<i32>() {
                Some(v) if *v < 0 => Err(InitError::new("negative parent value")),
                Some(v) => Ok(Box::new(v + self.bump)),
                None => Err(InitError::new("unexpected value type")),
            }
        }
    }

    /// A strong handle plus the key a store sees for it.
    pub(crate) struct Owned {
        pub(crate) strong: Option<Arc<TestKey>>,
        pub(crate) key: SlotKey,
    }

    impl Owned {
        /// Simulate the handle being dropped.
        pub(crate) fn clear(&mut self) {
            self.strong = None;
        }
    }

    pub(crate) fn key_with_hash(raw: u32) -> Owned {
        key_with(raw, 0)
    }

    pub(crate) fn key_with(raw: u32, bump: i32) -> Owned {
        let strong = Arc::new(TestKey { bump });
        let weak: Weak<dyn Key> = Arc::downgrade(&strong) as Weak<dyn Key>;
        Owned {
            strong: Some(strong),
            key: SlotKey::new(weak, KeyHash::from_raw(raw)),
        }
    }

    /// Hash whose bucket is `bucket` in any table of at least `bucket + 1` pairs.
    pub(crate) fn hash_for_bucket(bucket: usize) -> u32 {
        (bucket as u32) << 1
    }

    pub(crate) fn fresh_key() -> Owned {
        let strong = Arc::new(TestKey { bump: 0 });
        let weak: Weak<dyn Key> = Arc::downgrade(&strong) as Weak<dyn Key>;
        Owned {
            strong: Some(strong),
            key: SlotKey::new(weak, KeyHash::next()),
        }
    }

    /// `get` as a handle performs it: fast probe, miss path, lazy install.
    pub(crate) fn get_or_init(store: &mut Store<i32>, key: &SlotKey, init: i32) -> i32 {
        if let Some(v) = store.get(key) {
            return *v;
        }
        match store.lookup_after_miss(key) {
            Lookup::Hit(v) => *v,
            Lookup::Miss(vacancy) => {
                store.install(key, init, vacancy);
                init
            }
        }
    }

    pub(crate) fn peek(store: &Store<i32>, key: &SlotKey) -> Option<i32> {
        match store.lookup_after_miss(key) {
            Lookup::Hit(v) => Some(*v),
            Lookup::Miss(_) => None,
        }
    }
}
