//! One independently locked shard of the cache.
//!
//! A segment owns a bucket array whose chains are linked through the
//! entries' `next` words, and an LRU list linked through `lru_prev` /
//! `lru_next`. Every entry reachable from a chain is on the LRU list and the
//! other way around; both memberships together count as one reference.
//!
//! ```text
//!   buckets                      LRU (head = most recently used)
//!   ┌───┐
//!   │ 0 │──► [A] ──► [C]         head ─► [C] ◄──► [A] ◄──► [B] ◄── tail
//!   │ 1 │──► [B]
//!   │ 2 │
//!   │ 3 │
//!   └───┘
//! ```
//!
//! All chain, LRU and counter mutation happens under the segment mutex, and
//! so does the final release that frees a block. Readers get an
//! [`EntryGuard`] carrying its own reference, so an entry that is replaced,
//! removed or evicted while read is only unlinked; the last holder frees it.

use std::collections::HashSet;
use std::sync::Arc;

use crate::entry::{self, Entry, EntryGuard};
use crate::hashtable::Buckets;
use crate::memory::{Address, MemoryBackend, NULL};
use crate::metrics::{CacheStats, SegmentMetrics};
use crate::sync::Mutex;
use crate::{CacheError, InvariantError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutMode {
    /// Insert, replacing any entry with the same key
    Replace,
    /// Insert only when no entry with the same key exists
    IfAbsent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutOutcome {
    Added,
    Replaced,
    /// `IfAbsent` found an existing entry; nothing changed
    Present,
}

/// A block allocated for a new entry that is not linked yet. Dropping it
/// frees the block.
struct PendingBlock<'a, M: MemoryBackend> {
    mem: &'a M,
    address: Address,
}

impl<M: MemoryBackend> PendingBlock<'_, M> {
    /// Give up ownership once the table holds the block.
    fn into_linked(self) -> Address {
        let address = self.address;
        std::mem::forget(self);
        address
    }
}

impl<M: MemoryBackend> Drop for PendingBlock<'_, M> {
    fn drop(&mut self) {
        // SAFETY: never linked, sole owner
        unsafe { self.mem.free(self.address) };
    }
}

/// State guarded by the segment mutex.
#[derive(Debug)]
struct Table {
    buckets: Buckets,
    lru_head: Address,
    lru_tail: Address,
    entries: u64,
    used_bytes: u64,
    capacity: u64,
}

// Every method below requires that the chains and the LRU list only hold
// live, initialized entries of `mem`.
impl Table {
    unsafe fn find<M: MemoryBackend>(&self, mem: &M, hash: u64, key: &[u8]) -> Address {
        let mut address = self.buckets.head(hash);
        while address != NULL {
            let entry = Entry::at(mem, address);
            // cheap hash check before touching key bytes
            if entry.hash() == hash && entry.compare_key(key) {
                return address;
            }
            address = entry.next();
        }
        NULL
    }

    unsafe fn link<M: MemoryBackend>(&mut self, mem: &M, address: Address) {
        let entry = Entry::at(mem, address);
        let hash = entry.hash();

        entry.set_next(self.buckets.head(hash));
        self.buckets.set_head(hash, address);
        self.lru_push_head(mem, entry);

        self.entries += 1;
        self.used_bytes += entry.alloc_len();
    }

    unsafe fn unlink<M: MemoryBackend>(&mut self, mem: &M, address: Address) {
        let entry = Entry::at(mem, address);
        let hash = entry.hash();

        let mut prev = NULL;
        let mut current = self.buckets.head(hash);
        while current != NULL && current != address {
            prev = current;
            current = Entry::at(mem, current).next();
        }
        debug_assert_eq!(current, address, "entry missing from its bucket chain");

        if current == address {
            if prev == NULL {
                self.buckets.set_head(hash, entry.next());
            } else {
                Entry::at(mem, prev).set_next(entry.next());
            }
        }
        entry.set_next(NULL);
        self.lru_remove(mem, entry);

        self.entries -= 1;
        self.used_bytes -= entry.alloc_len();
    }

    unsafe fn lru_push_head<M: MemoryBackend>(&mut self, mem: &M, entry: Entry<'_, M>) {
        let address = entry.address();
        entry.set_lru_prev(NULL);
        entry.set_lru_next(self.lru_head);

        if self.lru_head != NULL {
            Entry::at(mem, self.lru_head).set_lru_prev(address);
        } else {
            self.lru_tail = address;
        }
        self.lru_head = address;
    }

    unsafe fn lru_remove<M: MemoryBackend>(&mut self, mem: &M, entry: Entry<'_, M>) {
        let prev = entry.lru_prev();
        let next = entry.lru_next();

        if prev != NULL {
            Entry::at(mem, prev).set_lru_next(next);
        } else {
            self.lru_head = next;
        }

        if next != NULL {
            Entry::at(mem, next).set_lru_prev(prev);
        } else {
            self.lru_tail = prev;
        }

        entry.set_lru_prev(NULL);
        entry.set_lru_next(NULL);
    }

    unsafe fn touch<M: MemoryBackend>(&mut self, mem: &M, entry: Entry<'_, M>) {
        if self.lru_head != entry.address() {
            self.lru_remove(mem, entry);
            self.lru_push_head(mem, entry);
        }
    }

    fn over_load_factor(&self, load_factor: f64) -> bool {
        self.entries as f64 > self.buckets.len() as f64 * load_factor
    }
}

/// A shard of the hash table: bucket chains, LRU list and counters behind a
/// single mutex.
pub struct Segment<M: MemoryBackend> {
    id: usize,
    mem: Arc<M>,
    table: Mutex<Table>,
    load_factor: f64,
    metrics: SegmentMetrics,
}

impl<M: MemoryBackend> Segment<M> {
    pub(crate) fn new(
        id: usize,
        mem: Arc<M>,
        buckets: usize,
        capacity: u64,
        load_factor: f64,
    ) -> Self {
        Self {
            id,
            mem,
            table: Mutex::new(Table {
                buckets: Buckets::new(buckets),
                lru_head: NULL,
                lru_tail: NULL,
                entries: 0,
                used_bytes: 0,
                capacity,
            }),
            load_factor,
            metrics: SegmentMetrics::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn metrics(&self) -> &SegmentMetrics {
        &self.metrics
    }

    /// Find the entry for `key`, mark it most recently used and return it
    /// with an extra reference held by the guard.
    pub fn lookup(&self, hash: u64, key: &[u8]) -> Option<EntryGuard<'_, M>> {
        let mem = &*self.mem;
        let mut table = self.table.lock();

        // SAFETY: the table only links live entries of `mem`
        let address = unsafe { table.find(mem, hash, key) };
        if address == NULL {
            drop(table);
            self.metrics.misses.increment();
            return None;
        }

        // SAFETY: linked, therefore live; the new reference keeps it so
        let entry = unsafe { Entry::at(mem, address) };
        entry.reference();
        unsafe { table.touch(mem, entry) };
        drop(table);

        self.metrics.hits.increment();
        Some(EntryGuard::new(self, entry))
    }

    /// Presence check. Leaves LRU order and hit counters alone.
    pub fn contains(&self, hash: u64, key: &[u8]) -> bool {
        let table = self.table.lock();
        // SAFETY: the table only links live entries of `mem`
        unsafe { table.find(&*self.mem, hash, key) != NULL }
    }

    /// Insert or replace. Returns `true` when an existing entry was replaced.
    pub fn put(&self, hash: u64, key: &[u8], value: &[u8]) -> Result<bool, CacheError> {
        let outcome = self.put_with(
            hash,
            key,
            value.len() as u64,
            |out| out.copy_from_slice(value),
            PutMode::Replace,
        )?;
        Ok(outcome == PutOutcome::Replaced)
    }

    /// Insert unless the key is present. Returns `true` when inserted.
    pub fn put_if_absent(&self, hash: u64, key: &[u8], value: &[u8]) -> Result<bool, CacheError> {
        let outcome = self.put_with(
            hash,
            key,
            value.len() as u64,
            |out| out.copy_from_slice(value),
            PutMode::IfAbsent,
        )?;
        Ok(outcome == PutOutcome::Added)
    }

    /// Allocate and fill a new entry, then link it.
    ///
    /// The block is allocated and written before the lock is taken. On any
    /// error, or if `write_value` panics, the segment is left exactly as it
    /// was and the block is returned to the backend.
    pub(crate) fn put_with<F>(
        &self,
        hash: u64,
        key: &[u8],
        value_len: u64,
        write_value: F,
        mode: PutMode,
    ) -> Result<PutOutcome, CacheError>
    where
        F: FnOnce(&mut [u8]),
    {
        let mem = &*self.mem;

        // a present key wins regardless of the new value's size
        if mode == PutMode::IfAbsent && self.contains(hash, key) {
            return Ok(PutOutcome::Present);
        }

        let key_len = key.len() as u64;
        let bytes = entry::alloc_len(key_len, value_len);

        let block = match mem.allocate(bytes) {
            Ok(address) => PendingBlock { mem, address },
            Err(e) => {
                self.metrics.put_fails.increment();
                tracing::warn!(segment = self.id, bytes, "entry allocation failed");
                return Err(e);
            }
        };

        // SAFETY: fresh block of `bytes` bytes, not yet visible to anyone
        let entry = unsafe { Entry::at(mem, block.address) };
        entry.init(hash, key_len, value_len);
        entry.write_key(key);
        write_value(entry.value_mut());

        let mut table = self.table.lock();

        // SAFETY: the table only links live entries of `mem`
        let existing = unsafe { table.find(mem, hash, key) };
        if existing != NULL && mode == PutMode::IfAbsent {
            drop(table);
            return Ok(PutOutcome::Present);
        }

        if bytes > table.capacity {
            let capacity = table.capacity;
            drop(table);
            self.metrics.put_fails.increment();
            return Err(CacheError::EntryTooLarge {
                size: bytes,
                capacity,
            });
        }

        let outcome = if existing == NULL {
            PutOutcome::Added
        } else {
            unsafe { self.retire(&mut table, existing) };
            PutOutcome::Replaced
        };

        unsafe {
            self.make_room(&mut table, bytes);
            table.link(mem, block.into_linked());
        }

        if table.over_load_factor(self.load_factor) {
            unsafe { self.rehash(&mut table) };
        }
        drop(table);

        match outcome {
            PutOutcome::Replaced => self.metrics.puts_replaced.increment(),
            _ => self.metrics.puts_added.increment(),
        }
        Ok(outcome)
    }

    /// Unlink the entry for `key` and drop the segment's reference to it.
    /// Returns `true` if an entry was removed.
    pub fn remove(&self, hash: u64, key: &[u8]) -> bool {
        let mut table = self.table.lock();

        // SAFETY: the table only links live entries of `mem`
        let address = unsafe { table.find(&*self.mem, hash, key) };
        if address == NULL {
            return false;
        }

        unsafe { self.retire(&mut table, address) };
        drop(table);

        self.metrics.removes.increment();
        true
    }

    /// Evict least recently used entries until at least `target_free_bytes`
    /// have been reclaimed or the segment is empty. Returns the bytes
    /// reclaimed.
    pub fn evict_for_capacity(&self, target_free_bytes: u64) -> u64 {
        let mut table = self.table.lock();
        let mut reclaimed = 0;

        while reclaimed < target_free_bytes && table.lru_tail != NULL {
            reclaimed += unsafe { self.evict_tail(&mut table) };
        }

        reclaimed
    }

    /// Change the byte capacity, evicting until the segment fits.
    pub fn set_capacity(&self, capacity: u64) {
        let mut table = self.table.lock();
        table.capacity = capacity;
        unsafe { self.make_room(&mut table, 0) };
    }

    /// Unlink every entry. Returns the number of entries removed.
    pub fn clear(&self) -> u64 {
        let mut table = self.table.lock();
        let mut removed = 0;

        while table.lru_head != NULL {
            let head = table.lru_head;
            unsafe { self.retire(&mut table, head) };
            removed += 1;
        }

        removed
    }

    /// Keys of the `n` most recently used entries, most recent first.
    pub fn hot_keys(&self, n: usize) -> Vec<Vec<u8>> {
        let mem = &*self.mem;
        let table = self.table.lock();
        let mut keys = Vec::with_capacity(n.min(table.entries as usize));

        let mut address = table.lru_head;
        while address != NULL && keys.len() < n {
            // SAFETY: on the LRU list, therefore live
            let entry = unsafe { Entry::at(mem, address) };
            keys.push(entry.key().to_vec());
            address = entry.lru_next();
        }

        keys
    }

    pub fn entry_count(&self) -> u64 {
        self.table.lock().entries
    }

    pub fn rehash_count(&self) -> u64 {
        self.metrics.rehashes.value()
    }

    pub fn bucket_count(&self) -> usize {
        self.table.lock().buckets.len()
    }

    pub fn used_bytes(&self) -> u64 {
        self.table.lock().used_bytes
    }

    pub fn capacity(&self) -> u64 {
        self.table.lock().capacity
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, used_bytes, capacity) = {
            let table = self.table.lock();
            (table.entries, table.used_bytes, table.capacity)
        };

        CacheStats {
            hits: self.metrics.hits.value(),
            misses: self.metrics.misses.value(),
            puts_added: self.metrics.puts_added.value(),
            puts_replaced: self.metrics.puts_replaced.value(),
            put_fails: self.metrics.put_fails.value(),
            removes: self.metrics.removes.value(),
            evictions: self.metrics.evictions.value(),
            rehashes: self.metrics.rehashes.value(),
            entries,
            used_bytes,
            capacity,
        }
    }

    /// Walk chains and LRU list and check they agree with each other and
    /// with the counters.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        let mem = &*self.mem;
        let table = self.table.lock();

        let mut on_lru = HashSet::new();
        let mut bytes = 0;
        let mut prev = NULL;
        let mut address = table.lru_head;
        while address != NULL {
            // SAFETY: on the LRU list, therefore live
            let entry = unsafe { Entry::at(mem, address) };
            if entry.lru_prev() != prev {
                return Err(InvariantError::new(format!(
                    "lru_prev of {address:#x} is {:#x}, expected {prev:#x}",
                    entry.lru_prev()
                )));
            }
            if entry.ref_count() == 0 {
                return Err(InvariantError::new(format!(
                    "linked entry {address:#x} has reference count 0"
                )));
            }
            if !on_lru.insert(address) {
                return Err(InvariantError::new(format!("cycle in LRU list at {address:#x}")));
            }
            bytes += entry.alloc_len();
            prev = address;
            address = entry.lru_next();
        }
        if table.lru_tail != prev {
            return Err(InvariantError::new(format!(
                "lru tail is {:#x}, last reachable entry is {prev:#x}",
                table.lru_tail
            )));
        }

        let mut chained = 0u64;
        for head in table.buckets.heads() {
            let mut address = head;
            while address != NULL {
                // SAFETY: chained, therefore live
                let entry = unsafe { Entry::at(mem, address) };
                if table.buckets.head(entry.hash()) != head {
                    return Err(InvariantError::new(format!(
                        "entry {address:#x} chained in the wrong bucket"
                    )));
                }
                if !on_lru.contains(&address) {
                    return Err(InvariantError::new(format!(
                        "entry {address:#x} chained but not on the LRU list"
                    )));
                }
                chained += 1;
                if chained > table.entries {
                    return Err(InvariantError::new("more chained entries than counted"));
                }
                address = entry.next();
            }
        }

        if chained != table.entries || on_lru.len() as u64 != table.entries {
            return Err(InvariantError::new(format!(
                "entry count {} but {chained} chained and {} on the LRU list",
                table.entries,
                on_lru.len()
            )));
        }
        if bytes != table.used_bytes {
            return Err(InvariantError::new(format!(
                "used bytes {} but linked entries hold {bytes}",
                table.used_bytes
            )));
        }

        Ok(())
    }

    /// Return a reference taken by [`lookup`](Self::lookup). The block is
    /// freed here, under the lock, when this was the last holder.
    pub(crate) fn release(&self, address: Address) {
        let _table = self.table.lock();

        // SAFETY: the caller's reference keeps the block live
        let entry = unsafe { Entry::at(&*self.mem, address) };
        if entry.dereference() {
            unsafe { self.mem.free(address) };
        }
    }

    /// Unlink an entry and drop the table's reference to it. Returns the
    /// bytes it occupied.
    unsafe fn retire(&self, table: &mut Table, address: Address) -> u64 {
        let mem = &*self.mem;
        let entry = Entry::at(mem, address);
        let bytes = entry.alloc_len();

        table.unlink(mem, address);
        if entry.dereference() {
            mem.free(address);
        }

        bytes
    }

    unsafe fn evict_tail(&self, table: &mut Table) -> u64 {
        let tail = table.lru_tail;
        let bytes = self.retire(table, tail);
        self.metrics.evictions.increment();
        tracing::trace!(segment = self.id, bytes, "evicted least recently used entry");
        bytes
    }

    /// Evict from the tail until `bytes` more fit under the capacity.
    unsafe fn make_room(&self, table: &mut Table, bytes: u64) {
        while table.used_bytes + bytes > table.capacity && table.lru_tail != NULL {
            self.evict_tail(table);
        }
    }

    unsafe fn rehash(&self, table: &mut Table) {
        let before = table.buckets.len();
        if table.buckets.grow(&*self.mem) {
            self.metrics.rehashes.increment();
            tracing::debug!(
                segment = self.id,
                from = before,
                to = table.buckets.len(),
                entries = table.entries,
                "rehashed segment"
            );
        }
    }
}

impl<M: MemoryBackend> std::fmt::Debug for Segment<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: MemoryBackend> Drop for Segment<M> {
    fn drop(&mut self) {
        self.clear();
    }
}
