use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Inclusive block range, `start <= end` always holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidRange { start, end });
        }

        Ok(Self { start, end })
    }

    pub fn single(block: u64) -> Self {
        Self {
            start: block,
            end: block,
        }
    }

    /// Number of blocks covered, never zero.
    pub fn width(&self) -> u64 {
        self.end - self.start + 1
    }

    /// True if one range ends exactly one block before the other starts.
    pub fn is_adjacent(&self, other: &BlockRange) -> bool {
        self.end.checked_add(1) == Some(other.start) || other.end.checked_add(1) == Some(self.start)
    }

    /// Splits at the midpoint. The left half gets the extra block when the width is odd.
    /// Returns `None` for single block ranges.
    pub fn split(&self) -> Option<(BlockRange, BlockRange)> {
        if self.start == self.end {
            return None;
        }

        let mid = self.start + (self.width() - 1) / 2;

        Some((
            BlockRange {
                start: self.start,
                end: mid,
            },
            BlockRange {
                start: mid + 1,
                end: self.end,
            },
        ))
    }

    /// Consecutive sub-ranges of at most `size` blocks. The last one is truncated at `self.end`.
    pub fn chunks(&self, size: NonZeroU64) -> Chunks {
        Chunks {
            next: Some(self.start),
            end: self.end,
            size: size.get(),
        }
    }

    /// The tiling shared by population and verification: `step_size` chunks,
    /// each cut into `range_size` sub-ranges. Ranges never cross a step boundary.
    pub fn tile(
        &self,
        range_size: NonZeroU64,
        step_size: NonZeroU64,
    ) -> impl Iterator<Item = BlockRange> {
        self.chunks(step_size)
            .flat_map(move |chunk| chunk.chunks(range_size))
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

pub struct Chunks {
    next: Option<u64>,
    end: u64,
    size: u64,
}

impl Iterator for Chunks {
    type Item = BlockRange;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next?;
        let end = start.saturating_add(self.size - 1).min(self.end);

        self.next = match end.checked_add(1) {
            Some(n) if n <= self.end => Some(n),
            _ => None,
        };

        Some(BlockRange { start, end })
    }
}
