//! A segmented hash table cache whose entries live in raw memory blocks.
//!
//! Keys and values are opaque byte strings stored outside any managed
//! collection, one block per entry, in the layout described in [`entry`].
//! The table is split into independently locked [`Segment`]s selected by the
//! high bits of the key hash. Each segment keeps its own bucket array, which
//! doubles when the load factor is exceeded, and its own LRU list, which
//! drives eviction once the segment's byte capacity is reached.
//!
//! Reads return an [`EntryGuard`]. The guard holds a reference on the entry
//! block, so a concurrent replace, remove or eviction only unlinks the entry
//! and the block is freed when the last guard goes away.
//!
//! ```
//! use offheap_lru::Cache;
//!
//! let cache = Cache::builder()
//!     .segment_count(4)
//!     .capacity(16 * 1024 * 1024)
//!     .build();
//!
//! cache.put(b"hello", b"world").unwrap();
//! assert_eq!(cache.get(b"hello").unwrap().value(), b"world");
//!
//! assert!(cache.remove(b"hello"));
//! assert!(cache.get(b"hello").is_none());
//! ```

mod block;
mod hashtable;
mod metrics;
mod segment;
mod serializer;
mod typed;

pub mod entry;
pub mod memory;

pub(crate) mod sync;


pub use block::BlockSizer;
pub use entry::EntryGuard;
pub use hashtable::{KeyHasher, MAX_BUCKETS};
pub use memory::{Address, HeapBackend, MemoryBackend, TrackingBackend, NULL};
pub use metrics::{CacheStats, Counter, SegmentMetrics};
pub use segment::Segment;
pub use serializer::{
    BytesSerializer, CacheSerializer, I32Serializer, SerializeError, StringSerializer,
    U32Serializer, U64Serializer,
};
pub use typed::TypedCache;

use std::sync::Arc;

use segment::{PutMode, PutOutcome};

/// Largest supported number of segments.
pub const MAX_SEGMENTS: usize = 1 << 16;

const DEFAULT_HASH_TABLE_SIZE: usize = 8192;
const DEFAULT_LOAD_FACTOR: f64 = 0.75;
const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;

/// Errors returned by cache writes and backend allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The memory backend could not provide a block
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },

    /// The entry would not fit in its segment even if the segment were empty
    #[error("entry of {size} bytes exceeds segment capacity of {capacity} bytes")]
    EntryTooLarge { size: u64, capacity: u64 },
}

/// Errors returned when a cache or backend is configured with invalid parameters
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("segment count must be a power of two between 1 and 65536, got {0}")]
    InvalidSegmentCount(usize),

    #[error("hash table size must be between 1 and 2^30, got {0}")]
    InvalidHashTableSize(usize),

    #[error("load factor must be finite and greater than zero, got {0}")]
    InvalidLoadFactor(f64),

    #[error("capacity must leave every segment at least one byte, got {0}")]
    InvalidCapacity(u64),

    #[error("block granularity must be a power of two, got {0}")]
    InvalidGranularity(u64),
}

/// Returned by `check_invariants` when internal links or counters disagree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invariant violated: {0}")]
pub struct InvariantError(String);

impl InvariantError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Core cache data shared between clones of a [`Cache`]
struct CacheCore<M: MemoryBackend> {
    segments: Box<[Segment<M>]>,
    segment_shift: u32,
    hasher: KeyHasher,
    mem: Arc<M>,
}

/// Off-heap LRU cache.
///
/// Cloning is cheap and yields another handle to the same cache.
pub struct Cache<M: MemoryBackend = HeapBackend> {
    core: Arc<CacheCore<M>>,
}

impl<M: MemoryBackend> Clone for Cache<M> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

/// Builder for constructing a Cache with custom configuration
#[derive(Debug)]
pub struct CacheBuilder<M = HeapBackend> {
    segment_count: Option<usize>,
    hash_table_size: usize,
    load_factor: f64,
    capacity: u64,
    hash_seeds: Option<[u64; 4]>,
    backend: M,
}

impl CacheBuilder<HeapBackend> {
    /// Create a new CacheBuilder with default settings
    pub fn new() -> Self {
        Self {
            segment_count: None,
            hash_table_size: DEFAULT_HASH_TABLE_SIZE,
            load_factor: DEFAULT_LOAD_FACTOR,
            capacity: DEFAULT_CAPACITY,
            hash_seeds: None,
            backend: HeapBackend::new(),
        }
    }
}

impl Default for CacheBuilder<HeapBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MemoryBackend> CacheBuilder<M> {
    /// Set the number of segments
    ///
    /// Must be a power of two no larger than [`MAX_SEGMENTS`]. Default is twice
    /// the available parallelism, rounded up to a power of two.
    pub fn segment_count(mut self, count: usize) -> Self {
        self.segment_count = Some(count);
        self
    }

    /// Set the initial number of buckets per segment
    ///
    /// Rounded up to a power of two. Default is 8192. Segments double their
    /// bucket array as entries are added, so this only sets the starting point.
    pub fn hash_table_size(mut self, size: usize) -> Self {
        self.hash_table_size = size;
        self
    }

    /// Set the load factor that triggers a rehash
    ///
    /// A segment rehashes once it holds more than `buckets * load_factor`
    /// entries. Default is 0.75.
    pub fn load_factor(mut self, load_factor: f64) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Set the total capacity in bytes
    ///
    /// Split evenly across segments. Default is 64MB. Entry headers and key
    /// padding count against the capacity.
    pub fn capacity(mut self, bytes: u64) -> Self {
        self.capacity = bytes;
        self
    }

    /// Seed the key hasher instead of using random seeds
    pub fn hash_seeds(mut self, seeds: [u64; 4]) -> Self {
        self.hash_seeds = Some(seeds);
        self
    }

    /// Use a different memory backend
    pub fn backend<B: MemoryBackend>(self, backend: B) -> CacheBuilder<B> {
        CacheBuilder {
            segment_count: self.segment_count,
            hash_table_size: self.hash_table_size,
            load_factor: self.load_factor,
            capacity: self.capacity,
            hash_seeds: self.hash_seeds,
            backend,
        }
    }

    /// Build the Cache, validating the configuration
    pub fn try_build(self) -> Result<Cache<M>, ConfigError> {
        let segment_count = self.segment_count.unwrap_or_else(default_segment_count);
        if !segment_count.is_power_of_two() || segment_count > MAX_SEGMENTS {
            return Err(ConfigError::InvalidSegmentCount(segment_count));
        }

        if self.hash_table_size == 0 || self.hash_table_size > MAX_BUCKETS {
            return Err(ConfigError::InvalidHashTableSize(self.hash_table_size));
        }

        if !self.load_factor.is_finite() || self.load_factor <= 0.0 {
            return Err(ConfigError::InvalidLoadFactor(self.load_factor));
        }

        let segment_capacity = self.capacity / segment_count as u64;
        if segment_capacity == 0 {
            return Err(ConfigError::InvalidCapacity(self.capacity));
        }

        let hasher = match self.hash_seeds {
            Some(seeds) => KeyHasher::with_seeds(seeds),
            None => KeyHasher::new(),
        };

        let mem = Arc::new(self.backend);
        let segments = (0..segment_count)
            .map(|id| {
                Segment::new(
                    id,
                    Arc::clone(&mem),
                    self.hash_table_size,
                    segment_capacity,
                    self.load_factor,
                )
            })
            .collect();

        tracing::debug!(
            segments = segment_count,
            buckets = self.hash_table_size,
            capacity = self.capacity,
            load_factor = self.load_factor,
            "cache created"
        );

        let core = Arc::new(CacheCore {
            segments,
            segment_shift: 64 - segment_count.trailing_zeros(),
            hasher,
            mem,
        });

        Ok(Cache { core })
    }

    /// Build the Cache with the configured settings
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid. Use
    /// [`try_build`](Self::try_build) to handle the error instead.
    pub fn build(self) -> Cache<M> {
        match self.try_build() {
            Ok(cache) => cache,
            Err(e) => panic!("invalid cache configuration: {e}"),
        }
    }
}

fn default_segment_count() -> usize {
    let threads = std::thread::available_parallelism().map_or(1, |n| n.get());
    (threads * 2).next_power_of_two().min(MAX_SEGMENTS)
}

impl Cache<HeapBackend> {
    /// Create a new Cache with default settings
    ///
    /// Default configuration:
    /// - Segments: twice the available parallelism, rounded to a power of two
    /// - Hash table: 8192 buckets per segment
    /// - Load factor: 0.75
    /// - Capacity: 64MB
    ///
    /// For custom configuration, use CacheBuilder:
    /// ```
    /// use offheap_lru::CacheBuilder;
    ///
    /// let cache = CacheBuilder::new()
    ///     .capacity(256 * 1024 * 1024) // 256MB
    ///     .segment_count(16)
    ///     .hash_table_size(1024)
    ///     .build();
    /// ```
    pub fn new() -> Self {
        CacheBuilder::new().build()
    }

    pub fn builder() -> CacheBuilder<HeapBackend> {
        CacheBuilder::new()
    }
}

impl Default for Cache<HeapBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MemoryBackend> Cache<M> {
    /// Hash a key with this cache's hasher.
    pub fn hash_key(&self, key: &[u8]) -> u64 {
        self.core.hasher.hash(key)
    }

    /// Index of the segment owning `hash`: its top `log2(segment_count)` bits.
    #[inline]
    fn segment_index(&self, hash: u64) -> usize {
        // a shift by 64 would overflow; one segment owns every hash
        if self.core.segment_shift >= 64 {
            0
        } else {
            (hash >> self.core.segment_shift) as usize
        }
    }

    #[inline]
    fn segment_for(&self, hash: u64) -> &Segment<M> {
        &self.core.segments[self.segment_index(hash)]
    }

    /// Get an entry with zero-copy access to its key and value.
    ///
    /// The entry becomes the most recently used of its segment. The returned
    /// guard keeps the block alive until dropped, even if the key is replaced,
    /// removed or evicted in the meantime.
    pub fn get(&self, key: &[u8]) -> Option<EntryGuard<'_, M>> {
        let hash = self.hash_key(key);
        self.segment_for(hash).lookup(hash, key)
    }

    /// Check for a key without touching LRU order or hit counters.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        let hash = self.hash_key(key);
        self.segment_for(hash).contains(hash, key)
    }

    /// Insert or replace an entry. Returns `true` when a previous entry for the
    /// key was replaced.
    ///
    /// Least recently used entries of the key's segment are evicted to make
    /// room. On error the cache is unchanged.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool, CacheError> {
        let hash = self.hash_key(key);
        self.segment_for(hash).put(hash, key, value)
    }

    /// Insert an entry only if the key is absent. Returns `true` when inserted.
    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, CacheError> {
        let hash = self.hash_key(key);
        self.segment_for(hash).put_if_absent(hash, key, value)
    }

    pub(crate) fn put_with<F>(
        &self,
        key: &[u8],
        value_len: u64,
        write_value: F,
        mode: PutMode,
    ) -> Result<PutOutcome, CacheError>
    where
        F: FnOnce(&mut [u8]),
    {
        let hash = self.hash_key(key);
        self.segment_for(hash)
            .put_with(hash, key, value_len, write_value, mode)
    }

    /// Remove an entry. Returns `true` if the key was present.
    pub fn remove(&self, key: &[u8]) -> bool {
        let hash = self.hash_key(key);
        self.segment_for(hash).remove(hash, key)
    }

    /// Evict least recently used entries until at least `target_free_bytes`
    /// have been reclaimed or the cache is empty. Returns the bytes reclaimed.
    ///
    /// Every segment is first asked for an equal share; segments that run dry
    /// leave the remainder to a second sweep.
    pub fn evict_for_capacity(&self, target_free_bytes: u64) -> u64 {
        let segments = &self.core.segments;
        let share = target_free_bytes.div_ceil(segments.len() as u64);
        let mut reclaimed = 0;

        for segment in segments.iter() {
            if reclaimed >= target_free_bytes {
                return reclaimed;
            }
            reclaimed += segment.evict_for_capacity(share.min(target_free_bytes - reclaimed));
        }

        for segment in segments.iter() {
            if reclaimed >= target_free_bytes {
                break;
            }
            reclaimed += segment.evict_for_capacity(target_free_bytes - reclaimed);
        }

        reclaimed
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let removed: u64 = self.core.segments.iter().map(|s| s.clear()).sum();
        tracing::debug!(removed, "cache cleared");
    }

    /// Number of entries across all segments.
    pub fn len(&self) -> u64 {
        self.core.segments.iter().map(|s| s.entry_count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of bucket array doublings across all segments.
    pub fn rehash_count(&self) -> u64 {
        self.core.segments.iter().map(|s| s.rehash_count()).sum()
    }

    pub fn capacity(&self) -> u64 {
        self.core.segments.iter().map(|s| s.capacity()).sum()
    }

    /// Change the total capacity, evicting from every segment that no longer
    /// fits its share.
    ///
    /// Fails with [`ConfigError::InvalidCapacity`], leaving every segment
    /// unchanged, when `bytes` would give a segment no capacity at all.
    pub fn set_capacity(&self, bytes: u64) -> Result<(), ConfigError> {
        let per_segment = bytes / self.core.segments.len() as u64;
        if per_segment == 0 {
            return Err(ConfigError::InvalidCapacity(bytes));
        }

        for segment in self.core.segments.iter() {
            segment.set_capacity(per_segment);
        }
        tracing::debug!(capacity = bytes, per_segment, "cache capacity changed");
        Ok(())
    }

    /// Bytes held by linked entries, headers and padding included.
    pub fn used_bytes(&self) -> u64 {
        self.core.segments.iter().map(|s| s.used_bytes()).sum()
    }

    /// Up to `n` recently used keys.
    ///
    /// Recency is only ordered within a segment, so the result interleaves
    /// the segments' most recent keys: every segment's first key, then every
    /// segment's second key, and so on.
    pub fn hot_keys(&self, n: usize) -> Vec<Vec<u8>> {
        let mut per_segment: Vec<std::vec::IntoIter<Vec<u8>>> = self
            .core
            .segments
            .iter()
            .map(|s| s.hot_keys(n).into_iter())
            .collect();

        let mut keys = Vec::with_capacity(n);
        while keys.len() < n {
            let before = keys.len();
            for iter in per_segment.iter_mut() {
                if keys.len() == n {
                    break;
                }
                if let Some(key) = iter.next() {
                    keys.push(key);
                }
            }
            if keys.len() == before {
                break;
            }
        }

        keys
    }

    /// Snapshot of counters summed across segments.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for segment in self.core.segments.iter() {
            stats += segment.stats();
        }
        stats
    }

    /// Zero every segment's counters. Entry and byte totals are unaffected.
    pub fn reset_stats(&self) {
        for segment in self.core.segments.iter() {
            segment.metrics().reset();
        }
    }

    pub fn segment_count(&self) -> usize {
        self.core.segments.len()
    }

    pub fn segment(&self, index: usize) -> Option<&Segment<M>> {
        self.core.segments.get(index)
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment<M>> {
        self.core.segments.iter()
    }

    /// The memory backend entries are allocated from.
    pub fn backend(&self) -> &M {
        &self.core.mem
    }

    /// Check every segment's internal invariants.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        for segment in self.core.segments.iter() {
            segment.check_invariants()?;
        }
        Ok(())
    }
}

impl<M: MemoryBackend> std::fmt::Debug for Cache<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("segments", &self.core.segments.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod cache_tests {
    use super::*;
    use crate::entry::alloc_len;

    fn test_cache(segments: usize) -> Cache<Arc<TrackingBackend>> {
        CacheBuilder::new()
            .segment_count(segments)
            .hash_table_size(16)
            .capacity(1 << 24)
            .backend(Arc::new(TrackingBackend::new()))
            .build()
    }

    #[test]
    fn test_basic_put_get_remove() {
        let cache = test_cache(4);

        assert_eq!(cache.put(b"key", b"value"), Ok(false));
        assert_eq!(cache.get(b"key").unwrap().value(), b"value");
        assert!(cache.contains_key(b"key"));
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.put(b"key", b"other"), Ok(true));
        assert_eq!(cache.get(b"key").unwrap().value(), b"other");
        assert_eq!(cache.len(), 1);

        assert!(cache.remove(b"key"));
        assert!(!cache.remove(b"key"));
        assert!(cache.get(b"key").is_none());
        assert!(cache.is_empty());
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_segment_selection_uses_high_bits() {
        let cache = test_cache(8);

        assert_eq!(cache.segment_index(0), 0);
        assert_eq!(cache.segment_index(u64::MAX), 7);
        assert_eq!(cache.segment_index(0x2000_0000_0000_0000), 1);
        assert_eq!(cache.segment_index(0x1fff_ffff_ffff_ffff), 0);
        assert_eq!(cache.segment_index(0xe000_0000_0000_0000), 7);
    }

    #[test]
    fn test_single_segment_owns_every_hash() {
        let cache = test_cache(1);
        assert_eq!(cache.segment_index(0), 0);
        assert_eq!(cache.segment_index(u64::MAX), 0);

        for i in 0..100u32 {
            cache.put(&i.to_be_bytes(), b"v").unwrap();
        }
        assert_eq!(cache.segment(0).unwrap().entry_count(), 100);
    }

    #[test]
    fn test_keys_land_in_their_segment() {
        let cache = test_cache(16);
        for i in 0..1000u32 {
            cache.put(&i.to_be_bytes(), &i.to_le_bytes()).unwrap();
        }

        for i in 0..1000u32 {
            let key = i.to_be_bytes();
            let hash = cache.hash_key(&key);
            let segment = cache.segment((hash >> 60) as usize).unwrap();
            assert!(segment.contains(hash, &key));
        }

        let per_segment: u64 = cache.segments().map(|s| s.entry_count()).sum();
        assert_eq!(per_segment, 1000);
        assert!(cache.segments().all(|s| s.entry_count() > 0));
    }

    #[test]
    fn test_put_if_absent() {
        let cache = test_cache(2);
        assert_eq!(cache.put_if_absent(b"k", b"1"), Ok(true));
        assert_eq!(cache.put_if_absent(b"k", b"2"), Ok(false));
        assert_eq!(cache.get(b"k").unwrap().value(), b"1");
        assert_eq!(cache.backend().outstanding(), 1);
    }

    #[test]
    fn test_evict_for_capacity_spreads_over_segments() {
        let cache = test_cache(4);
        for i in 0..400u32 {
            cache.put(&i.to_be_bytes(), b"value").unwrap();
        }
        let per_entry = alloc_len(4, 5);
        let used = cache.used_bytes();
        assert_eq!(used, 400 * per_entry);

        let reclaimed = cache.evict_for_capacity(100 * per_entry);
        assert!(reclaimed >= 100 * per_entry);
        assert_eq!(cache.used_bytes(), used - reclaimed);
        assert_eq!(cache.stats().evictions, reclaimed / per_entry);

        // more than is left empties the cache
        let rest = cache.evict_for_capacity(u64::MAX);
        assert_eq!(reclaimed + rest, used);
        assert!(cache.is_empty());
        assert_eq!(cache.backend().outstanding(), 0);
    }

    #[test]
    fn test_evict_for_capacity_reaches_target_with_empty_segments() {
        let cache = test_cache(8);
        // all entries in one segment
        let mut keys = Vec::new();
        let mut i = 0u32;
        while keys.len() < 10 {
            let key = i.to_be_bytes();
            if cache.segment_index(cache.hash_key(&key)) == 3 {
                keys.push(key);
                cache.put(&key, b"v").unwrap();
            }
            i += 1;
        }

        let per_entry = alloc_len(4, 1);
        assert_eq!(cache.evict_for_capacity(6 * per_entry), 6 * per_entry);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_capacity_split_across_segments() {
        let cache = CacheBuilder::new()
            .segment_count(4)
            .capacity(4000)
            .build();
        assert_eq!(cache.capacity(), 4000);
        assert!(cache.segments().all(|s| s.capacity() == 1000));

        cache.set_capacity(2000).unwrap();
        assert!(cache.segments().all(|s| s.capacity() == 500));
        assert_eq!(cache.stats().capacity, 2000);
    }

    #[test]
    fn test_set_capacity_below_segment_count() {
        let cache = CacheBuilder::new()
            .segment_count(4)
            .capacity(4000)
            .build();
        cache.put(b"key", b"value").unwrap();

        assert_eq!(cache.set_capacity(3), Err(ConfigError::InvalidCapacity(3)));
        assert_eq!(cache.set_capacity(0), Err(ConfigError::InvalidCapacity(0)));
        assert!(cache.segments().all(|s| s.capacity() == 1000));
        assert_eq!(cache.get(b"key").unwrap().value(), b"value");

        // one byte per segment is still a valid, if useless, capacity
        cache.set_capacity(4).unwrap();
        assert!(cache.segments().all(|s| s.capacity() == 1));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entry_too_large() {
        let cache = CacheBuilder::new()
            .segment_count(2)
            .capacity(256)
            .build();

        let result = cache.put(b"key", &[0; 100]);
        assert_eq!(
            result,
            Err(CacheError::EntryTooLarge {
                size: alloc_len(3, 100),
                capacity: 128
            })
        );
        assert!(cache.is_empty());
        assert_eq!(cache.stats().put_fails, 1);
    }

    #[test]
    fn test_out_of_memory_surfaces_to_caller() {
        let cache = CacheBuilder::new()
            .segment_count(1)
            .backend(HeapBackend::new().with_limit(64))
            .build();

        let result = cache.put(b"key", &[0; 64]);
        assert_eq!(
            result,
            Err(CacheError::OutOfMemory {
                requested: alloc_len(3, 64)
            })
        );
        assert!(cache.is_empty());
        assert_eq!(cache.backend().allocated_bytes(), 0);
    }

    #[test]
    fn test_clear_releases_everything() {
        let mem = Arc::new(TrackingBackend::new());
        let cache = CacheBuilder::new()
            .segment_count(4)
            .backend(Arc::clone(&mem))
            .build();

        for i in 0..100u32 {
            cache.put(&i.to_be_bytes(), b"v").unwrap();
        }
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.used_bytes(), 0);
        mem.assert_empty();
    }

    #[test]
    fn test_drop_releases_everything() {
        let mem = Arc::new(TrackingBackend::new());
        {
            let cache = CacheBuilder::new()
                .segment_count(4)
                .backend(Arc::clone(&mem))
                .build();
            for i in 0..100u32 {
                cache.put(&i.to_be_bytes(), b"v").unwrap();
            }
            let clone = cache.clone();
            drop(cache);
            assert_eq!(clone.len(), 100);
            assert_eq!(mem.outstanding(), 100);
        }
        mem.assert_empty();
    }

    #[test]
    fn test_stats_aggregate_and_reset() {
        let cache = test_cache(4);
        for i in 0..20u32 {
            cache.put(&i.to_be_bytes(), b"v").unwrap();
        }
        for i in 0..30u32 {
            drop(cache.get(&i.to_be_bytes()));
        }
        cache.put(&0u32.to_be_bytes(), b"w").unwrap();

        let stats = cache.stats();
        assert_eq!(stats.puts_added, 20);
        assert_eq!(stats.puts_replaced, 1);
        assert_eq!(stats.hits, 20);
        assert_eq!(stats.misses, 10);
        assert_eq!(stats.entries, 20);
        assert_eq!(stats.used_bytes, cache.used_bytes());

        cache.reset_stats();
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.puts_added, 0);
        assert_eq!(stats.entries, 20);
    }

    #[test]
    fn test_hot_keys_interleaves_segments() {
        let cache = test_cache(1);
        cache.put(b"a", b"1").unwrap();
        cache.put(b"b", b"2").unwrap();
        cache.put(b"c", b"3").unwrap();
        drop(cache.get(b"a"));

        assert_eq!(cache.hot_keys(2), vec![b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(cache.hot_keys(10).len(), 3);

        let cache = test_cache(4);
        for i in 0..100u32 {
            cache.put(&i.to_be_bytes(), b"v").unwrap();
        }
        let hot = cache.hot_keys(10);
        assert_eq!(hot.len(), 10);
        assert!(hot.iter().all(|k| cache.contains_key(k)));
        assert_eq!(cache.hot_keys(1000).len(), 100);
    }

    #[test]
    fn test_hash_seeds_are_deterministic() {
        let a = CacheBuilder::new().segment_count(1).hash_seeds([1, 2, 3, 4]).build();
        let b = CacheBuilder::new().segment_count(1).hash_seeds([1, 2, 3, 4]).build();
        assert_eq!(a.hash_key(b"key"), b.hash_key(b"key"));
    }

    #[test]
    fn test_invalid_configuration() {
        let err = |builder: CacheBuilder| builder.try_build().unwrap_err();

        assert_eq!(
            err(CacheBuilder::new().segment_count(3)),
            ConfigError::InvalidSegmentCount(3)
        );
        assert_eq!(
            err(CacheBuilder::new().segment_count(0)),
            ConfigError::InvalidSegmentCount(0)
        );
        assert_eq!(
            err(CacheBuilder::new().segment_count(MAX_SEGMENTS * 2)),
            ConfigError::InvalidSegmentCount(MAX_SEGMENTS * 2)
        );
        assert_eq!(
            err(CacheBuilder::new().hash_table_size(0)),
            ConfigError::InvalidHashTableSize(0)
        );
        assert_eq!(
            err(CacheBuilder::new().load_factor(0.0)),
            ConfigError::InvalidLoadFactor(0.0)
        );
        assert!(matches!(
            err(CacheBuilder::new().load_factor(f64::NAN)),
            ConfigError::InvalidLoadFactor(_)
        ));
        assert_eq!(
            err(CacheBuilder::new().segment_count(8).capacity(7)),
            ConfigError::InvalidCapacity(7)
        );
    }

    #[test]
    #[should_panic(expected = "invalid cache configuration")]
    fn test_build_panics_on_invalid_configuration() {
        let _ = CacheBuilder::new().segment_count(5).build();
    }

    #[test]
    fn test_hash_table_size_rounds_up() {
        let cache = CacheBuilder::new()
            .segment_count(2)
            .hash_table_size(100)
            .build();
        assert!(cache.segments().all(|s| s.bucket_count() == 128));
    }

    #[test]
    fn test_default_segment_count_is_power_of_two() {
        let count = default_segment_count();
        assert!(count.is_power_of_two());
        assert!(count >= 2);
        assert!(count <= MAX_SEGMENTS);
    }
}
