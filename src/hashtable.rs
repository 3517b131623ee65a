use std::hash::BuildHasher;

use ahash::RandomState;

use crate::entry::Entry;
use crate::memory::{Address, MemoryBackend, NULL};

/// Largest bucket array a segment grows to.
pub const MAX_BUCKETS: usize = 1 << 30;

/// Hashes keys to the 64-bit values stored in entry headers.
///
/// Segment selection consumes the high bits and bucket selection the low
/// bits, so the hash must be well mixed across all 64 bits.
#[derive(Clone, Debug)]
pub struct KeyHasher {
    hash_builder: RandomState,
}

impl KeyHasher {
    pub fn new() -> Self {
        // Use fixed seeds in tests for deterministic behavior, random seeds in production
        #[cfg(test)]
        let hash_builder = RandomState::with_seeds(
            0xbb8c484891ec6c86,
            0x0522a25ae9c769f9,
            0xeed2797b9571bc75,
            0x4feb29c1fbbd59d0,
        );
        #[cfg(not(test))]
        let hash_builder = RandomState::new();

        Self { hash_builder }
    }

    pub fn with_seeds(seeds: [u64; 4]) -> Self {
        Self {
            hash_builder: RandomState::with_seeds(seeds[0], seeds[1], seeds[2], seeds[3]),
        }
    }

    #[inline]
    pub fn hash(&self, key: &[u8]) -> u64 {
        self.hash_builder.hash_one(key)
    }
}

impl Default for KeyHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Bucket array of one segment.
///
/// Each slot holds the address of the first entry of a chain linked through
/// the entries' `next` words. The slot count is a power of two so the bucket
/// index is `hash & mask`.
#[derive(Debug)]
pub(crate) struct Buckets {
    slots: Vec<Address>,
    mask: u64,
}

impl Buckets {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_BUCKETS).next_power_of_two();

        Self {
            slots: vec![NULL; capacity],
            mask: capacity as u64 - 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn index(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    #[inline]
    pub fn head(&self, hash: u64) -> Address {
        self.slots[self.index(hash)]
    }

    #[inline]
    pub fn set_head(&mut self, hash: u64, address: Address) {
        let index = self.index(hash);
        self.slots[index] = address;
    }

    /// Iterator over the non-empty chain heads.
    pub fn heads(&self) -> impl Iterator<Item = Address> + '_ {
        self.slots.iter().copied().filter(|head| *head != NULL)
    }

    /// Double the bucket array and relink every chained entry into it.
    ///
    /// Only `next` words and bucket slots are rewritten: no entry is
    /// allocated, copied or re-referenced, so nothing can be lost. Returns
    /// `false`, leaving the table as it was, when the array is already at
    /// [`MAX_BUCKETS`] or the larger array cannot be allocated.
    ///
    /// # Safety
    /// Every address reachable from the chains must be a live entry of `mem`.
    pub unsafe fn grow<M: MemoryBackend + ?Sized>(&mut self, mem: &M) -> bool {
        let capacity = self.slots.len() * 2;
        if capacity > MAX_BUCKETS {
            return false;
        }

        let mut slots: Vec<Address> = Vec::new();
        if slots.try_reserve_exact(capacity).is_err() {
            tracing::warn!(buckets = capacity, "cannot allocate bucket array, rehash skipped");
            return false;
        }
        slots.resize(capacity, NULL);
        let mask = capacity as u64 - 1;

        for head in self.slots.iter().copied() {
            let mut address = head;
            while address != NULL {
                let entry = Entry::at(mem, address);
                let next = entry.next();

                let index = (entry.hash() & mask) as usize;
                entry.set_next(slots[index]);
                slots[index] = address;

                address = next;
            }
        }

        self.slots = slots;
        self.mask = mask;
        true
    }
}
