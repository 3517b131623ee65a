use crate::ConfigError;

/// Rounds byte sizes to a fixed allocation granularity.
///
/// Block based backends (page pools, slab classes) hand out memory in
/// multiples of a granularity `G`. `BlockSizer` answers two questions for
/// such a backend without touching memory:
///
/// - how many bytes a request of `size` really occupies
///   ([`block_alloc_len`](Self::block_alloc_len))
/// - which granularity block the last byte of a `size` byte region falls in
///   ([`mem_block_index`](Self::mem_block_index))
///
/// The granularity is always a power of two so both reduce to shifts and masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizer {
    shift: u32,
}

impl BlockSizer {
    /// 4 KiB pages.
    pub const PAGE: BlockSizer = BlockSizer { shift: 12 };

    pub fn new(granularity: u64) -> Result<Self, ConfigError> {
        if !granularity.is_power_of_two() {
            return Err(ConfigError::InvalidGranularity(granularity));
        }

        Ok(Self {
            shift: granularity.trailing_zeros(),
        })
    }

    pub const fn granularity(&self) -> u64 {
        1 << self.shift
    }

    #[inline]
    const fn mask(&self) -> u64 {
        self.granularity() - 1
    }

    /// Round `size` up to the next multiple of the granularity. Exact
    /// multiples are returned unchanged.
    ///
    /// # Panics
    /// If the rounded length does not fit in a `u64`. Use
    /// [`checked_block_alloc_len`](Self::checked_block_alloc_len) for sizes
    /// that may come within one granularity of `u64::MAX`.
    #[inline]
    pub const fn block_alloc_len(&self, size: u64) -> u64 {
        match self.checked_block_alloc_len(size) {
            Some(len) => len,
            None => panic!("block length overflows u64"),
        }
    }

    /// [`block_alloc_len`](Self::block_alloc_len), or `None` when the rounded
    /// length does not fit in a `u64`.
    #[inline]
    pub const fn checked_block_alloc_len(&self, size: u64) -> Option<u64> {
        match size.checked_add(self.mask()) {
            Some(end) => Some(end & !self.mask()),
            None => None,
        }
    }

    /// Zero based index of the granularity block holding the last byte of a
    /// `size` byte region, i.e. `ceil(size / G) - 1`. Defined for every
    /// `size` from 1 to `u64::MAX`.
    ///
    /// # Panics
    /// If `size` is zero: an empty region has no last byte.
    #[inline]
    pub const fn mem_block_index(&self, size: u64) -> u64 {
        assert!(size > 0, "block index of an empty region");
        (size - 1) >> self.shift
    }
}

impl Default for BlockSizer {
    fn default() -> Self {
        Self::PAGE
    }
}
