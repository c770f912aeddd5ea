//! Fixed-size bit vector with first-fit area search.

use alloc::vec::Vec;

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-size bit vector; one bit per page of address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    bits: usize,
}

impl Bitmap {
    /// All-clear bitmap of `bits` bits, or `None` if the backing store
    /// cannot be allocated.
    #[must_use]
    pub fn try_new(bits: usize) -> Option<Self> {
        let len = bits.div_ceil(WORD_BITS);
        let mut words = Vec::new();
        words.try_reserve_exact(len).ok()?;
        words.resize(len, 0);
        Some(Self { words, bits })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.bits
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    #[inline]
    #[must_use]
    pub fn test(&self, bit: usize) -> bool {
        debug_assert!(bit < self.bits);
        self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    /// Sets `[start, start + count)`.
    pub fn set_range(&mut self, start: usize, count: usize) {
        assert!(start + count <= self.bits, "bitmap range out of bounds");
        for bit in start..start + count {
            self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        }
    }

    /// Clears `[start, start + count)`.
    pub fn clear_range(&mut self, start: usize, count: usize) {
        assert!(start + count <= self.bits, "bitmap range out of bounds");
        for bit in start..start + count {
            self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
        }
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn next_zero(&self, from: usize) -> Option<usize> {
        (from..self.bits).find(|&b| !self.test(b))
    }

    fn next_set(&self, from: usize, end: usize) -> Option<usize> {
        (from..end.min(self.bits)).find(|&b| self.test(b))
    }

    /// First index `>= start` of `count` clear bits whose index is a
    /// multiple of `align_mask + 1`.
    #[must_use]
    pub fn find_next_zero_area(&self, mut start: usize, count: usize, align_mask: usize) -> Option<usize> {
        loop {
            let index = self.next_zero(start)?;
            let index = (index + align_mask) & !align_mask;
            let end = index.checked_add(count)?;
            if end > self.bits {
                return None;
            }
            match self.next_set(index, end) {
                Some(busy) => start = busy + 1,
                None => return Some(index),
            }
        }
    }
}
