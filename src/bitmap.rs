//! Used-block bitmap for imaging runs.
//!
//! One bit per block, index = block number, 1 = used. Backed by a packed
//! word array with little-endian bit order within each word (bit 0 = LSB),
//! matching the standard Linux bitmap convention.
//!
//! The bitmap is built once per run (by a filesystem driver on clone, or
//! from the container on restore) and is read-only during block transfer.

use crate::error::ImageError;

const WORD_BITS: u64 = u64::BITS as u64;

/// A fixed-capacity bit vector over block indices.
pub struct Bitmap {
    words: Vec<u64>,
    total_blocks: u64,
}

impl Bitmap {
    /// Allocate a zeroed bitmap for `total_blocks` blocks.
    ///
    /// The word count is computed with checked arithmetic: if rounding
    /// `total_blocks` up to a whole word would overflow, or the word count
    /// does not fit in `usize`, this fails with [`ImageError::BitmapTooLarge`]
    /// rather than returning a silently truncated buffer.
    pub fn new(total_blocks: u64) -> Result<Self, ImageError> {
        let padded = total_blocks
            .checked_add(WORD_BITS - 1)
            .ok_or(ImageError::BitmapTooLarge {
                blocks: total_blocks,
            })?;
        let words = usize::try_from(padded / WORD_BITS).map_err(|_| ImageError::BitmapTooLarge {
            blocks: total_blocks,
        })?;
        Ok(Self {
            words: vec![0u64; words],
            total_blocks,
        })
    }

    /// Returns the number of blocks this bitmap covers.
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    #[inline]
    fn check_index(&self, index: u64) {
        assert!(
            index < self.total_blocks,
            "block index {index} out of range (total blocks {})",
            self.total_blocks
        );
    }

    /// Test whether block `index` is marked used.
    ///
    /// Panics if `index >= total_blocks`: an out-of-range index is an
    /// internal logic error, never silently ignored.
    #[inline]
    pub fn test(&self, index: u64) -> bool {
        self.check_index(index);
        let word = (index / WORD_BITS) as usize;
        let bit = index % WORD_BITS;
        self.words[word] & (1u64 << bit) != 0
    }

    /// Mark block `index` as used. Panics if `index >= total_blocks`.
    #[inline]
    pub fn set(&mut self, index: u64) {
        self.check_index(index);
        let word = (index / WORD_BITS) as usize;
        let bit = index % WORD_BITS;
        self.words[word] |= 1u64 << bit;
    }

    /// Mark block `index` as free. Panics if `index >= total_blocks`.
    #[inline]
    pub fn clear(&mut self, index: u64) {
        self.check_index(index);
        let word = (index / WORD_BITS) as usize;
        let bit = index % WORD_BITS;
        self.words[word] &= !(1u64 << bit);
    }

    /// Set every block to `used`.
    pub fn fill(&mut self, used: bool) {
        let value = if used { u64::MAX } else { 0 };
        for word in &mut self.words {
            *word = value;
        }
    }

    /// Count the used blocks via popcount, masking the partial final word.
    pub fn count_used(&self) -> u64 {
        if self.total_blocks == 0 {
            return 0;
        }

        let full_words = (self.total_blocks / WORD_BITS) as usize;
        let remaining_bits = self.total_blocks % WORD_BITS;

        let mut count: u64 = 0;
        for &word in &self.words[..full_words] {
            count += word.count_ones() as u64;
        }

        if remaining_bits > 0 {
            let mask = (1u64 << remaining_bits) - 1;
            count += (self.words[full_words] & mask).count_ones() as u64;
        }

        count
    }

    /// Length of the contiguous run of used blocks starting at `start`,
    /// capped at `max_len`. Returns 0 if `start` itself is free.
    ///
    /// Used by the restore engine to size coalesced writes.
    pub fn run_of_used(&self, start: u64, max_len: u64) -> u64 {
        self.check_index(start);
        let end = start.saturating_add(max_len).min(self.total_blocks);
        let mut index = start;
        while index < end && self.test(index) {
            index += 1;
        }
        index - start
    }

    /// Iterate over the indices of all used blocks in ascending order.
    pub fn iter_used(&self) -> UsedBlocksIter<'_> {
        UsedBlocksIter {
            bitmap: self,
            index: 0,
        }
    }
}

/// Iterator over used block indices in a `Bitmap`.
pub struct UsedBlocksIter<'a> {
    bitmap: &'a Bitmap,
    index: u64,
}

impl Iterator for UsedBlocksIter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while self.index < self.bitmap.total_blocks {
            let i = self.index;
            self.index += 1;
            if self.bitmap.test(i) {
                return Some(i);
            }
        }
        None
    }
}
