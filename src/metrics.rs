use crate::sync::{AtomicU64, Ordering};
use std::ops::AddAssign;

/// Monotonically increasing counter
#[derive(Debug)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-segment counters
///
/// Purely observational: nothing in the segment reads these back to make a
/// decision. Each segment owns its own set so that tests can assert on a
/// single shard and so that counters of different segments never contend on
/// the same cache line.
#[derive(Debug, Default)]
pub struct SegmentMetrics {
    pub hits: Counter,
    pub misses: Counter,

    // Writes
    pub puts_added: Counter,
    pub puts_replaced: Counter,
    pub put_fails: Counter,
    pub removes: Counter,

    // Maintenance
    pub evictions: Counter,
    pub rehashes: Counter,
}

impl SegmentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every counter. Rehash count included.
    pub fn reset(&self) {
        self.hits.reset();
        self.misses.reset();
        self.puts_added.reset();
        self.puts_replaced.reset();
        self.put_fails.reset();
        self.removes.reset();
        self.evictions.reset();
        self.rehashes.reset();
    }
}

/// Point-in-time statistics of one segment or, summed, of a whole cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts_added: u64,
    pub puts_replaced: u64,
    pub put_fails: u64,
    pub removes: u64,
    pub evictions: u64,
    pub rehashes: u64,

    // gauges captured at snapshot time
    pub entries: u64,
    pub used_bytes: u64,
    pub capacity: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    /// Bytes that can still be linked without evicting.
    pub fn free_bytes(&self) -> u64 {
        self.capacity.saturating_sub(self.used_bytes)
    }
}

impl AddAssign for CacheStats {
    fn add_assign(&mut self, other: Self) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.puts_added += other.puts_added;
        self.puts_replaced += other.puts_replaced;
        self.put_fails += other.put_fails;
        self.removes += other.removes;
        self.evictions += other.evictions;
        self.rehashes += other.rehashes;
        self.entries += other.entries;
        self.used_bytes += other.used_bytes;
        self.capacity += other.capacity;
    }
}
