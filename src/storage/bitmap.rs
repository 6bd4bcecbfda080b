//! Block bitmap: one bit per fixed-size block of the objects file.
//!
//! Allocation is first-fit starting from a "last known free" hint. The scan
//! steps over fully allocated bytes eight blocks at a time, wraps around once,
//! and only then grows the map. Growth is unbounded; there is no out-of-space
//! condition at this level.

pub const BLOCK_SIZE: usize = 256;

/// Blocks added each time the bitmap runs out of room.
pub const BITMAP_GROWTH: usize = 4096;

/// Blocks needed to hold `size` bytes. Never zero.
pub fn blocks_needed(size: usize) -> usize {
    size.div_ceil(BLOCK_SIZE).max(1)
}

#[derive(Debug, Clone)]
pub struct BlockBitmap {
    bits: Vec<u8>,
    last_free: usize,
}

impl Default for BlockBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockBitmap {
    pub fn new() -> Self {
        Self {
            bits: vec![0u8; BITMAP_GROWTH / 8],
            last_free: 0,
        }
    }

    /// Number of blocks the map currently covers.
    pub fn len(&self) -> usize {
        self.bits.len() * 8
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn last_free(&self) -> usize {
        self.last_free
    }

    pub fn is_set(&self, block: usize) -> bool {
        block < self.len() && self.bits[block / 8] & (1 << (block % 8)) != 0
    }

    pub fn allocated_count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Index of the last allocated block, if any.
    pub fn high_water(&self) -> Option<usize> {
        let byte = self.bits.iter().rposition(|&b| b != 0)?;
        let bit = 7 - self.bits[byte].leading_zeros() as usize;
        Some(byte * 8 + bit)
    }

    /// First allocated block at or after `from`.
    pub fn next_set(&self, from: usize) -> Option<usize> {
        let mut block = from;
        while block < self.len() {
            if block % 8 == 0 && self.bits[block / 8] == 0 {
                block += 8;
                continue;
            }
            if self.is_set(block) {
                return Some(block);
            }
            block += 1;
        }
        None
    }

    /// Reserve a run of blocks for `size` bytes and return its first block.
    pub fn allocate(&mut self, size: usize) -> usize {
        let needed = blocks_needed(size);
        loop {
            let hint = self.last_free.min(self.len());
            let found = self
                .find_run(hint, needed)
                .or_else(|| if hint > 0 { self.find_run(0, needed) } else { None });

            if let Some(start) = found {
                self.set_range(start, needed, true);
                self.last_free = start + needed;
                log::debug!("allocated blocks {}..{}", start, start + needed);
                return start;
            }
            self.grow(needed);
        }
    }

    /// Release the run previously returned by `allocate(size)`. The hint moves
    /// to the freed run so the space is reused first.
    pub fn free(&mut self, start: usize, size: usize) {
        let needed = blocks_needed(size);
        self.set_range(start, needed, false);
        self.last_free = start;
        log::debug!("freed blocks {}..{}", start, start + needed);
    }

    /// Mark an existing extent as allocated, growing as needed. Used when the
    /// map is rebuilt from the index.
    pub fn mark(&mut self, start: usize, size: usize) {
        let needed = blocks_needed(size);
        while start + needed > self.len() {
            self.grow(start + needed - self.len());
        }
        self.set_range(start, needed, true);
    }

    /// Clear a single block without touching the hint.
    pub fn clear(&mut self, block: usize) {
        if block < self.len() {
            self.bits[block / 8] &= !(1 << (block % 8));
        }
    }

    fn set_range(&mut self, start: usize, count: usize, value: bool) {
        for block in start..start + count {
            let mask = 1 << (block % 8);
            if value {
                self.bits[block / 8] |= mask;
            } else {
                self.bits[block / 8] &= !mask;
            }
        }
    }

    fn find_run(&self, from: usize, needed: usize) -> Option<usize> {
        let end = self.len();
        let mut block = from;
        while block + needed <= end {
            if block % 8 == 0 && self.bits[block / 8] == 0xFF {
                block += 8;
                continue;
            }
            if self.is_set(block) {
                block += 1;
                continue;
            }
            match (block..block + needed).find(|&b| self.is_set(b)) {
                None => return Some(block),
                Some(used) => block = used + 1,
            }
        }
        None
    }

    fn grow(&mut self, needed: usize) {
        let extra = BITMAP_GROWTH.max(needed).div_ceil(8);
        self.bits.resize(self.bits.len() + extra, 0);
        log::debug!("block bitmap grown to {} blocks", self.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_blocks_needed_rounds_up() {
        assert_eq!(blocks_needed(0), 1);
        assert_eq!(blocks_needed(1), 1);
        assert_eq!(blocks_needed(BLOCK_SIZE), 1);
        assert_eq!(blocks_needed(BLOCK_SIZE + 1), 2);
    }

    #[test]
    fn test_first_fit_reuse() {
        let mut bitmap = BlockBitmap::new();
        let a = bitmap.allocate(10);
        assert_eq!(a, 0);
        let b = bitmap.allocate(3 * BLOCK_SIZE);
        assert_eq!(b, 1);

        bitmap.free(a, 10);
        assert!(!bitmap.is_set(0));
        assert_eq!(bitmap.allocate(BLOCK_SIZE), 0);
    }

    #[test]
    fn test_hint_skips_too_small_hole() {
        let mut bitmap = BlockBitmap::new();
        let a = bitmap.allocate(BLOCK_SIZE);
        let _b = bitmap.allocate(BLOCK_SIZE);
        bitmap.free(a, BLOCK_SIZE);

        // one-block hole at 0 cannot hold two blocks
        let c = bitmap.allocate(2 * BLOCK_SIZE);
        assert_eq!(c, 2);
    }

    #[test]
    fn test_wraps_before_growing() {
        let mut bitmap = BlockBitmap::new();
        let first = bitmap.allocate(BLOCK_SIZE);
        let rest = bitmap.allocate((BITMAP_GROWTH - 1) * BLOCK_SIZE);
        assert_eq!(rest, 1);
        assert_eq!(bitmap.allocated_count(), BITMAP_GROWTH);

        bitmap.free(first, BLOCK_SIZE);
        // hint now at 0; push it to the end and make sure the scan wraps
        bitmap.last_free = BITMAP_GROWTH - 1;
        assert_eq!(bitmap.allocate(1), 0);
        assert_eq!(bitmap.len(), BITMAP_GROWTH);
    }

    #[test]
    fn test_grows_when_full() {
        let mut bitmap = BlockBitmap::new();
        bitmap.allocate(BITMAP_GROWTH * BLOCK_SIZE);
        let next = bitmap.allocate(1);
        assert_eq!(next, BITMAP_GROWTH);
        assert_eq!(bitmap.len(), 2 * BITMAP_GROWTH);
    }

    #[test]
    fn test_large_request_grows_enough() {
        let mut bitmap = BlockBitmap::new();
        let start = bitmap.allocate((BITMAP_GROWTH + 10) * BLOCK_SIZE);
        assert_eq!(start, 0);
        assert!(bitmap.len() >= BITMAP_GROWTH + 10);
    }

    #[test]
    fn test_mark_next_set_high_water() {
        let mut bitmap = BlockBitmap::new();
        assert_eq!(bitmap.high_water(), None);
        bitmap.mark(BITMAP_GROWTH + 3, 2 * BLOCK_SIZE);
        assert!(bitmap.is_set(BITMAP_GROWTH + 4));
        assert_eq!(bitmap.next_set(0), Some(BITMAP_GROWTH + 3));
        assert_eq!(bitmap.high_water(), Some(BITMAP_GROWTH + 4));
        bitmap.clear(BITMAP_GROWTH + 3);
        assert_eq!(bitmap.next_set(0), Some(BITMAP_GROWTH + 4));
    }

    proptest! {
        #[test]
        fn free_restores_bitmap(
            existing in prop::collection::vec(1usize..2000, 0..20),
            size in 1usize..5000,
        ) {
            let mut bitmap = BlockBitmap::new();
            for s in existing {
                bitmap.allocate(s);
            }
            let before = bitmap.as_bytes().to_vec();
            let start = bitmap.allocate(size);
            bitmap.free(start, size);
            prop_assert_eq!(&bitmap.as_bytes()[..before.len()], &before[..]);
            prop_assert!(bitmap.as_bytes()[before.len()..].iter().all(|&b| b == 0));
        }

        #[test]
        fn extents_never_overlap(
            ops in prop::collection::vec((any::<bool>(), 1usize..3000), 1..80),
        ) {
            let mut bitmap = BlockBitmap::new();
            let mut live: Vec<(usize, usize)> = Vec::new();
            for (alloc, size) in ops {
                if alloc || live.is_empty() {
                    let start = bitmap.allocate(size);
                    let end = start + blocks_needed(size);
                    for &(s, sz) in &live {
                        let e = s + blocks_needed(sz);
                        prop_assert!(end <= s || start >= e, "overlap {}..{} with {}..{}", start, end, s, e);
                    }
                    live.push((start, size));
                } else {
                    let (s, sz) = live.remove(size % live.len());
                    bitmap.free(s, sz);
                }
            }
            let expected: usize = live.iter().map(|&(_, sz)| blocks_needed(sz)).sum();
            prop_assert_eq!(bitmap.allocated_count(), expected);
        }
    }
}
