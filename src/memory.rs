//! Raw memory backends.
//!
//! Every entry byte lives in a block handed out by a [`MemoryBackend`]. The
//! rest of the crate only ever holds [`Address`]es and goes through the
//! backend to read or write them. Accessors are `unsafe`: the backend is a
//! thin primitive, not a safety boundary, and callers promise that an address
//! is a live block of that backend and that the accessed range lies inside it.
//!
//! [`TrackingBackend`] turns those promises into checked assertions and is the
//! backend to use in tests.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::BlockSizer;
use crate::CacheError;

/// Address of a raw block. `NULL` marks "no block" in link fields.
pub type Address = u64;

pub const NULL: Address = 0;

/// Alignment of every block. Entry header fields are 8-byte words.
pub const BLOCK_ALIGN: usize = 8;

/// Allocation and raw access over blocks addressed by [`Address`].
///
/// # Safety contract of the accessors
///
/// For every `unsafe` method, `address` must have been returned by
/// [`allocate`](MemoryBackend::allocate) on this backend and not freed since,
/// and `offset..offset + len` must lie within the requested block length.
pub trait MemoryBackend: Send + Sync {
    /// Allocate a zeroed block of at least `len` bytes, aligned to [`BLOCK_ALIGN`].
    fn allocate(&self, len: u64) -> Result<Address, CacheError>;

    /// Return a block to the backend.
    ///
    /// # Safety
    /// `address` is live and is not used again afterwards.
    unsafe fn free(&self, address: Address);

    /// Raw pointer to `len` bytes at `offset`. Creates no reference, so
    /// pointers to overlapping ranges may coexist.
    ///
    /// # Safety
    /// See the trait level contract.
    unsafe fn as_ptr(&self, address: Address, offset: u64, len: u64) -> *mut u8;

    /// # Safety
    /// See the trait level contract.
    unsafe fn slice(&self, address: Address, offset: u64, len: u64) -> &[u8];

    /// # Safety
    /// See the trait level contract. In addition no other reference to the
    /// same bytes may be alive while the returned slice is used.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slice_mut(&self, address: Address, offset: u64, len: u64) -> &mut [u8];

    /// Atomic view of the 8-byte word at `offset`. `address + offset` must be
    /// 8-byte aligned.
    ///
    /// # Safety
    /// See the trait level contract.
    unsafe fn atomic_long(&self, address: Address, offset: u64) -> &AtomicU64;

    /// # Safety
    /// See the trait level contract.
    unsafe fn get_byte(&self, address: Address, offset: u64) -> u8 {
        self.slice(address, offset, 1)[0]
    }

    /// # Safety
    /// See the trait level contract.
    unsafe fn get_long(&self, address: Address, offset: u64) -> u64 {
        let bytes = self.slice(address, offset, 8);
        u64::from_ne_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ])
    }

    /// # Safety
    /// See the trait level contract.
    unsafe fn put_long(&self, address: Address, offset: u64, value: u64) {
        self.slice_mut(address, offset, 8)
            .copy_from_slice(&value.to_ne_bytes());
    }

    /// # Safety
    /// See the trait level contract.
    unsafe fn set_memory(&self, address: Address, offset: u64, len: u64, value: u8) {
        self.slice_mut(address, offset, len).fill(value);
    }

    /// Copy `src` into the block at `offset`.
    ///
    /// # Safety
    /// See the trait level contract, with `len = src.len()`.
    unsafe fn copy_from_slice(&self, src: &[u8], address: Address, offset: u64) {
        self.slice_mut(address, offset, src.len() as u64)
            .copy_from_slice(src);
    }

    /// Copy `len` bytes between two blocks. The ranges may overlap.
    ///
    /// # Safety
    /// See the trait level contract, for both ranges.
    unsafe fn copy_memory(
        &self,
        src: Address,
        src_offset: u64,
        dst: Address,
        dst_offset: u64,
        len: u64,
    ) {
        let from = self.as_ptr(src, src_offset, len);
        let to = self.as_ptr(dst, dst_offset, len);
        std::ptr::copy(from, to, len as usize);
    }
}

impl<M: MemoryBackend + ?Sized> MemoryBackend for Arc<M> {
    fn allocate(&self, len: u64) -> Result<Address, CacheError> {
        (**self).allocate(len)
    }

    unsafe fn free(&self, address: Address) {
        (**self).free(address)
    }

    unsafe fn as_ptr(&self, address: Address, offset: u64, len: u64) -> *mut u8 {
        (**self).as_ptr(address, offset, len)
    }

    unsafe fn slice(&self, address: Address, offset: u64, len: u64) -> &[u8] {
        (**self).slice(address, offset, len)
    }

    unsafe fn slice_mut(&self, address: Address, offset: u64, len: u64) -> &mut [u8] {
        (**self).slice_mut(address, offset, len)
    }

    unsafe fn atomic_long(&self, address: Address, offset: u64) -> &AtomicU64 {
        (**self).atomic_long(address, offset)
    }
}

/// Blocks from the global allocator, outside any managed collection.
///
/// Each block carries a hidden 8-byte prefix holding its total length, so
/// [`free`](MemoryBackend::free) needs nothing but the address.
#[derive(Debug)]
pub struct HeapBackend {
    sizer: Option<BlockSizer>,
    limit: u64,
    allocated: AtomicU64,
}

impl HeapBackend {
    const PREFIX: u64 = BLOCK_ALIGN as u64;

    pub fn new() -> Self {
        Self {
            sizer: None,
            limit: u64::MAX,
            allocated: AtomicU64::new(0),
        }
    }

    /// Fail allocations once `limit` bytes (prefixes included) are outstanding.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Round every allocation up to the sizer's granularity.
    pub fn with_block_sizer(mut self, sizer: BlockSizer) -> Self {
        self.sizer = Some(sizer);
        self
    }

    /// Bytes currently held by live blocks, prefixes and rounding included.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    fn block_len(&self, len: u64) -> Option<u64> {
        let total = len.checked_add(Self::PREFIX)?;
        match self.sizer {
            Some(sizer) => sizer.checked_block_alloc_len(total),
            None => Some(total),
        }
    }

    #[inline]
    unsafe fn ptr(&self, address: Address, offset: u64) -> *mut u8 {
        (address as *mut u8).add(offset as usize)
    }
}

impl Default for HeapBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend for HeapBackend {
    fn allocate(&self, len: u64) -> Result<Address, CacheError> {
        let out_of_memory = CacheError::OutOfMemory { requested: len };

        let total = self.block_len(len).ok_or(out_of_memory)?;
        let layout = usize::try_from(total)
            .ok()
            .and_then(|size| Layout::from_size_align(size, BLOCK_ALIGN).ok())
            .ok_or(out_of_memory)?;

        // Reserve against the limit before touching the allocator
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(total).filter(|next| *next <= self.limit)
            })
            .map_err(|_| out_of_memory)?;

        // SAFETY: layout has a non-zero size (at least PREFIX bytes)
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            self.allocated.fetch_sub(total, Ordering::AcqRel);
            return Err(out_of_memory);
        }

        // SAFETY: base is 8-byte aligned and at least PREFIX bytes long
        unsafe {
            (base as *mut u64).write(total);
        }

        Ok(base as Address + Self::PREFIX)
    }

    unsafe fn free(&self, address: Address) {
        debug_assert_ne!(address, NULL, "free of NULL address");

        let base = (address - Self::PREFIX) as *mut u8;
        let total = (base as *const u64).read();
        self.allocated.fetch_sub(total, Ordering::AcqRel);

        // SAFETY: the prefix holds the size the block was allocated with
        dealloc(
            base,
            Layout::from_size_align_unchecked(total as usize, BLOCK_ALIGN),
        );
    }

    unsafe fn as_ptr(&self, address: Address, offset: u64, _len: u64) -> *mut u8 {
        self.ptr(address, offset)
    }

    unsafe fn slice(&self, address: Address, offset: u64, len: u64) -> &[u8] {
        std::slice::from_raw_parts(self.ptr(address, offset), len as usize)
    }

    unsafe fn slice_mut(&self, address: Address, offset: u64, len: u64) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr(address, offset), len as usize)
    }

    unsafe fn atomic_long(&self, address: Address, offset: u64) -> &AtomicU64 {
        let ptr = self.ptr(address, offset) as *mut u64;
        debug_assert_eq!(ptr as usize % 8, 0, "unaligned atomic access at {address:#x}+{offset}");
        AtomicU64::from_ptr(ptr)
    }

    unsafe fn get_long(&self, address: Address, offset: u64) -> u64 {
        (self.ptr(address, offset) as *const u64).read_unaligned()
    }

    unsafe fn put_long(&self, address: Address, offset: u64, value: u64) {
        (self.ptr(address, offset) as *mut u64).write_unaligned(value)
    }
}

/// Debug backend that records every outstanding block.
///
/// Wraps another backend and checks each access against its registry:
/// touching a freed or unknown block, reading past the requested length and
/// freeing twice all panic. [`assert_empty`](Self::assert_empty) reports
/// leaks at the end of a test and [`clear`](Self::clear) forgets the records
/// between test cases.
#[derive(Debug)]
pub struct TrackingBackend<M = HeapBackend> {
    inner: M,
    live: Mutex<BTreeMap<Address, u64>>,
}

impl TrackingBackend<HeapBackend> {
    pub fn new() -> Self {
        Self::wrap(HeapBackend::new())
    }
}

impl Default for TrackingBackend<HeapBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MemoryBackend> TrackingBackend<M> {
    pub fn wrap(inner: M) -> Self {
        Self {
            inner,
            live: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Number of blocks allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.live.lock().len()
    }

    /// Sum of the requested lengths of all outstanding blocks.
    pub fn outstanding_bytes(&self) -> u64 {
        self.live.lock().values().sum()
    }

    pub fn is_live(&self, address: Address) -> bool {
        self.live.lock().contains_key(&address)
    }

    /// Panics if any block is still outstanding.
    pub fn assert_empty(&self) {
        let live = self.live.lock();
        if !live.is_empty() {
            let sample: Vec<String> = live
                .iter()
                .take(8)
                .map(|(address, len)| format!("{address:#x} ({len} bytes)"))
                .collect();
            panic!(
                "{} blocks still allocated: {}{}",
                live.len(),
                sample.join(", "),
                if live.len() > sample.len() { ", ..." } else { "" }
            );
        }
    }

    /// Forget all records without freeing anything.
    pub fn clear(&self) {
        self.live.lock().clear();
    }

    fn check(&self, address: Address, offset: u64, len: u64) {
        let live = self.live.lock();
        let Some(&block_len) = live.get(&address) else {
            panic!("access to freed or unknown block {address:#x}");
        };
        let end = offset.checked_add(len);
        if end.map_or(true, |end| end > block_len) {
            panic!(
                "out of bounds access to block {address:#x}: offset {offset} len {len}, block is {block_len} bytes"
            );
        }
    }
}

impl<M: MemoryBackend> MemoryBackend for TrackingBackend<M> {
    fn allocate(&self, len: u64) -> Result<Address, CacheError> {
        let address = self.inner.allocate(len)?;
        let previous = self.live.lock().insert(address, len);
        assert!(previous.is_none(), "block {address:#x} handed out twice");
        Ok(address)
    }

    unsafe fn free(&self, address: Address) {
        if self.live.lock().remove(&address).is_none() {
            panic!("double free or free of unknown block {address:#x}");
        }
        self.inner.free(address);
    }

    unsafe fn as_ptr(&self, address: Address, offset: u64, len: u64) -> *mut u8 {
        self.check(address, offset, len);
        self.inner.as_ptr(address, offset, len)
    }

    unsafe fn slice(&self, address: Address, offset: u64, len: u64) -> &[u8] {
        self.check(address, offset, len);
        self.inner.slice(address, offset, len)
    }

    unsafe fn slice_mut(&self, address: Address, offset: u64, len: u64) -> &mut [u8] {
        self.check(address, offset, len);
        self.inner.slice_mut(address, offset, len)
    }

    unsafe fn atomic_long(&self, address: Address, offset: u64) -> &AtomicU64 {
        self.check(address, offset, 8);
        self.inner.atomic_long(address, offset)
    }

    unsafe fn get_long(&self, address: Address, offset: u64) -> u64 {
        self.check(address, offset, 8);
        self.inner.get_long(address, offset)
    }

    unsafe fn put_long(&self, address: Address, offset: u64, value: u64) {
        self.check(address, offset, 8);
        self.inner.put_long(address, offset, value)
    }
}
