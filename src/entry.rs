//! Binary layout of a cache entry and accessors over it.
//!
//! An entry is one contiguous block:
//!
//! ```text
//!   0        8        16       24       32       40       48       56
//!   ┌────────┬────────┬────────┬────────┬────────┬────────┬────────┬──────────────────────┐
//!   │  hash  │key_len │val_len │  next  │lru_next│lru_prev│refcount│ key │pad│   value    │
//!   └────────┴────────┴────────┴────────┴────────┴────────┴────────┴──────────────────────┘
//! ```
//!
//! The key is padded to a multiple of 8 bytes so the value starts on a word
//! boundary whatever the key length.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::memory::{Address, MemoryBackend};
use crate::segment::Segment;

pub const OFF_HASH: u64 = 0;
pub const OFF_KEY_LEN: u64 = 8;
pub const OFF_VALUE_LEN: u64 = 16;
pub const OFF_NEXT: u64 = 24;
pub const OFF_LRU_NEXT: u64 = 32;
pub const OFF_LRU_PREV: u64 = 40;
pub const OFF_REFCOUNT: u64 = 48;
pub const OFF_DATA: u64 = 56;

/// Size of the fixed header preceding key and value.
pub const HEADER_SIZE: u64 = OFF_DATA;

/// Round `len` up to a multiple of 8.
#[inline]
pub const fn align8(len: u64) -> u64 {
    (len + 7) & !7
}

/// Bytes needed to store an entry with the given key and value lengths.
#[inline]
pub const fn alloc_len(key_len: u64, value_len: u64) -> u64 {
    HEADER_SIZE + align8(key_len) + value_len
}

/// Offset of the value from the start of the entry.
#[inline]
pub const fn value_offset(key_len: u64) -> u64 {
    OFF_DATA + align8(key_len)
}

/// Byte-range equality between two arbitrary locations.
///
/// # Safety
/// Both ranges must lie inside live blocks of `mem`.
pub unsafe fn compare<M: MemoryBackend + ?Sized>(
    mem: &M,
    a: Address,
    offset_a: u64,
    b: Address,
    offset_b: u64,
    len: u64,
) -> bool {
    if a == b && offset_a == offset_b {
        return true;
    }
    mem.slice(a, offset_a, len) == mem.slice(b, offset_b, len)
}

/// View over an entry block.
///
/// All accessors are plain reads and writes of the header words with no
/// validation. Key and value bytes are written once, before the entry is
/// linked into a segment, and never change afterwards.
pub struct Entry<'a, M: ?Sized> {
    mem: &'a M,
    address: Address,
}

impl<M: ?Sized> Clone for Entry<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: ?Sized> Copy for Entry<'_, M> {}

impl<'a, M: MemoryBackend + ?Sized> Entry<'a, M> {
    /// # Safety
    /// `address` must be a live block of `mem` holding at least
    /// [`HEADER_SIZE`] bytes, and once initialized at least
    /// [`alloc_len`](Self::alloc_len) bytes. The block must stay live while
    /// the view (or anything borrowed from it) is used.
    #[inline]
    pub unsafe fn at(mem: &'a M, address: Address) -> Self {
        Self { mem, address }
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.address
    }

    #[inline]
    fn get(&self, offset: u64) -> u64 {
        // SAFETY: header words lie inside the block per the `at` contract
        unsafe { self.mem.get_long(self.address, offset) }
    }

    #[inline]
    fn set(&self, offset: u64, value: u64) {
        // SAFETY: header words lie inside the block per the `at` contract
        unsafe { self.mem.put_long(self.address, offset, value) }
    }

    #[inline]
    fn refs(&self) -> &'a AtomicU64 {
        // SAFETY: the refcount word is 8-aligned inside the block
        unsafe { self.mem.atomic_long(self.address, OFF_REFCOUNT) }
    }

    /// Write a fresh header: one reference, no links.
    pub fn init(&self, hash: u64, key_len: u64, value_len: u64) {
        self.set(OFF_HASH, hash);
        self.set(OFF_KEY_LEN, key_len);
        self.set(OFF_VALUE_LEN, value_len);
        self.set(OFF_NEXT, 0);
        self.set(OFF_LRU_NEXT, 0);
        self.set(OFF_LRU_PREV, 0);
        self.refs().store(1, Ordering::Release);
    }

    pub fn hash(&self) -> u64 {
        self.get(OFF_HASH)
    }

    pub fn key_len(&self) -> u64 {
        self.get(OFF_KEY_LEN)
    }

    pub fn value_len(&self) -> u64 {
        self.get(OFF_VALUE_LEN)
    }

    pub fn next(&self) -> Address {
        self.get(OFF_NEXT)
    }

    pub fn set_next(&self, next: Address) {
        self.set(OFF_NEXT, next)
    }

    pub fn lru_next(&self) -> Address {
        self.get(OFF_LRU_NEXT)
    }

    pub fn set_lru_next(&self, next: Address) {
        self.set(OFF_LRU_NEXT, next)
    }

    pub fn lru_prev(&self) -> Address {
        self.get(OFF_LRU_PREV)
    }

    pub fn set_lru_prev(&self, prev: Address) {
        self.set(OFF_LRU_PREV, prev)
    }

    /// Total block length implied by the header.
    pub fn alloc_len(&self) -> u64 {
        alloc_len(self.key_len(), self.value_len())
    }

    pub fn key(&self) -> &'a [u8] {
        // SAFETY: key bytes lie inside an initialized block
        unsafe { self.mem.slice(self.address, OFF_DATA, self.key_len()) }
    }

    pub fn value(&self) -> &'a [u8] {
        let key_len = self.key_len();
        // SAFETY: value bytes lie inside an initialized block
        unsafe {
            self.mem
                .slice(self.address, value_offset(key_len), self.value_len())
        }
    }

    /// Copy the key into the block. Only valid before the entry is shared.
    pub fn write_key(&self, key: &[u8]) {
        debug_assert_eq!(key.len() as u64, self.key_len());
        // SAFETY: unshared block, range inside it
        unsafe { self.mem.copy_from_slice(key, self.address, OFF_DATA) }
    }

    /// Mutable value bytes. Only valid before the entry is shared.
    pub fn value_mut(&self) -> &'a mut [u8] {
        let key_len = self.key_len();
        // SAFETY: unshared block, range inside it
        unsafe {
            self.mem
                .slice_mut(self.address, value_offset(key_len), self.value_len())
        }
    }

    /// True when the stored key has length `key.len()` and equal bytes.
    pub fn compare_key(&self, key: &[u8]) -> bool {
        self.key_len() == key.len() as u64 && self.key() == key
    }

    pub fn ref_count(&self) -> u64 {
        self.refs().load(Ordering::Acquire)
    }

    /// Register one more holder.
    pub fn reference(&self) {
        self.refs().fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one holder. Returns `true` when this was the last one and the
    /// block must be freed by the caller.
    ///
    /// # Panics
    /// If the count is already zero. That is a double release somewhere and
    /// continuing would free a block twice.
    pub fn dereference(&self) -> bool {
        match self
            .refs()
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            }) {
            Ok(previous) => previous == 1,
            Err(_) => panic!(
                "illegal state: dereference of entry {:#x} with reference count 0",
                self.address
            ),
        }
    }
}

impl<M: MemoryBackend + ?Sized> std::fmt::Debug for Entry<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("address", &format_args!("{:#x}", self.address))
            .field("hash", &format_args!("{:#x}", self.hash()))
            .field("key_len", &self.key_len())
            .field("value_len", &self.value_len())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// A reference to an entry returned by a lookup.
///
/// This is a zero-copy view into the entry's block. The guard owns one
/// reference on the entry, so a concurrent replace, remove or eviction only
/// unlinks the block; it is freed once the last guard goes away.
///
/// The reference is returned automatically when the guard is dropped.
///
/// # Examples
///
/// ```
/// use offheap_lru::Cache;
///
/// let cache = Cache::builder().segment_count(1).build();
/// cache.put(b"key", b"value").unwrap();
///
/// let guard = cache.get(b"key").unwrap();
/// assert_eq!(guard.value(), b"value");
/// // Guard dropped here, reference released
/// ```
pub struct EntryGuard<'a, M: MemoryBackend> {
    segment: &'a Segment<M>,
    entry: Entry<'a, M>,
}

impl<'a, M: MemoryBackend> EntryGuard<'a, M> {
    /// The caller must already have taken the reference this guard releases.
    pub(crate) fn new(segment: &'a Segment<M>, entry: Entry<'a, M>) -> Self {
        Self { segment, entry }
    }

    pub fn key(&self) -> &[u8] {
        self.entry.key()
    }

    pub fn value(&self) -> &[u8] {
        self.entry.value()
    }

    pub fn hash(&self) -> u64 {
        self.entry.hash()
    }

    pub fn address(&self) -> Address {
        self.entry.address()
    }
}

impl<M: MemoryBackend> std::fmt::Debug for EntryGuard<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryGuard")
            .field("entry", &self.entry)
            .finish()
    }
}

impl<M: MemoryBackend> Drop for EntryGuard<'_, M> {
    fn drop(&mut self) {
        self.segment.release(self.entry.address());
    }
}
