//! Free block range allocator for BlockVFS
//!
//! Free space is tracked as a set of closed, pairwise disjoint index ranges.
//! Adjacent ranges are always merged, so the set stays as small as the
//! fragmentation of the image allows. Allocation is best-fit with the lowest
//! start index breaking ties, which makes every allocation reproducible from
//! the same free-set state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Error type for block range allocation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Out of space: requested {requested} blocks, {available} free")]
    OutOfSpace { requested: u64, available: u64 },
    #[error("Block {0} is already free")]
    DoubleFree(u32),
    #[error("Block {0} is already allocated")]
    BlockAlreadyAllocated(u32),
    #[error("Block {index} is outside the image ({total_blocks} blocks)")]
    OutOfRange { index: u32, total_blocks: u32 },
}

/// A closed interval `[min, max]` of block indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockIndexRange {
    min: u32,
    max: u32,
}

impl BlockIndexRange {
    /// Create a range; `None` when `min > max`
    pub fn new(min: u32, max: u32) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    /// The smallest index of the range
    pub fn min(&self) -> u32 {
        self.min
    }

    /// The largest index of the range
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Number of blocks in the range
    pub fn len(&self) -> u64 {
        u64::from(self.max - self.min) + 1
    }

    /// A range always holds at least one block
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, index: u32) -> bool {
        self.min <= index && index <= self.max
    }

    /// Iterate over the indices in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.min..=self.max
    }
}

/// Best-fit allocator over free block ranges
#[derive(Debug, Clone)]
pub struct BlockRangeAllocator {
    /// Free ranges keyed by start index, value is the inclusive end
    free: BTreeMap<u32, u32>,
    /// Number of blocks in the image, free or not
    total_blocks: u32,
    /// Number of free blocks
    free_blocks: u64,
}

impl BlockRangeAllocator {
    /// Create an allocator for `total_blocks` blocks, all of them free
    pub fn new(total_blocks: u32) -> Self {
        let mut allocator = Self {
            free: BTreeMap::new(),
            total_blocks,
            free_blocks: 0,
        };
        if total_blocks > 0 {
            allocator.insert_range(0, total_blocks - 1);
        }
        allocator
    }

    /// Rebuild the free set as the complement of `occupied` within `[0, total_blocks)`
    pub fn rebuild_from_occupied<I>(occupied: I, total_blocks: u32) -> Result<Self, AllocError>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut occupied: Vec<u32> = occupied.into_iter().collect();
        occupied.sort_unstable();

        for pair in occupied.windows(2) {
            if pair[0] == pair[1] {
                return Err(AllocError::BlockAlreadyAllocated(pair[0]));
            }
        }
        if let Some(&last) = occupied.last() {
            if last >= total_blocks {
                return Err(AllocError::OutOfRange {
                    index: last,
                    total_blocks,
                });
            }
        }

        let mut allocator = Self {
            free: BTreeMap::new(),
            total_blocks,
            free_blocks: 0,
        };

        let mut next = 0u32;
        for &index in &occupied {
            if index > next {
                allocator.insert_range(next, index - 1);
            }
            next = index + 1;
        }
        if next < total_blocks {
            allocator.insert_range(next, total_blocks - 1);
        }

        log::info!(
            "BLOCK_RANGES: rebuilt free set - {} free blocks in {} ranges out of {} total",
            allocator.free_blocks,
            allocator.free.len(),
            total_blocks
        );
        Ok(allocator)
    }

    /// Allocate `count` blocks.
    ///
    /// The smallest free range that can hold all of them is used, lowest start
    /// first on ties. When no single range is large enough, ranges are consumed
    /// from smallest to largest until `count` indices are collected.
    pub fn allocate(&mut self, count: u32) -> Result<Vec<u32>, AllocError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if u64::from(count) > self.free_blocks {
            log::debug!(
                "BLOCK_RANGES: cannot allocate {} blocks, {} free",
                count,
                self.free_blocks
            );
            return Err(AllocError::OutOfSpace {
                requested: u64::from(count),
                available: self.free_blocks,
            });
        }

        let best_fit = self
            .free
            .iter()
            .map(|(&start, &end)| (u64::from(end - start) + 1, start))
            .filter(|&(len, _)| len >= u64::from(count))
            .min();

        let indices = match best_fit {
            Some((_, start)) => self.take_from(start, count),
            None => {
                let mut by_size: Vec<(u64, u32)> = self
                    .free
                    .iter()
                    .map(|(&start, &end)| (u64::from(end - start) + 1, start))
                    .collect();
                by_size.sort_unstable();

                let mut indices = Vec::with_capacity(count as usize);
                for (len, start) in by_size {
                    let wanted = count - indices.len() as u32;
                    if wanted == 0 {
                        break;
                    }
                    let take = u64::from(wanted).min(len) as u32;
                    indices.extend(self.take_from(start, take));
                }
                indices
            }
        };

        log::debug!(
            "BLOCK_RANGES: allocated {} blocks, {} free remaining",
            indices.len(),
            self.free_blocks
        );
        Ok(indices)
    }

    /// Take `count` blocks from the front of the free range starting at `start`
    fn take_from(&mut self, start: u32, count: u32) -> Vec<u32> {
        let Some(end) = self.free.remove(&start) else {
            return Vec::new();
        };
        let last = start + (count - 1);
        if last < end {
            self.free.insert(last + 1, end);
        }
        self.free_blocks -= u64::from(count);
        (start..=last).collect()
    }

    /// Return blocks to the free set.
    ///
    /// Nothing is released unless every index is valid: in range, currently
    /// allocated, and listed once.
    pub fn release(&mut self, indices: &[u32]) -> Result<(), AllocError> {
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();

        for (i, &index) in sorted.iter().enumerate() {
            if index >= self.total_blocks {
                return Err(AllocError::OutOfRange {
                    index,
                    total_blocks: self.total_blocks,
                });
            }
            if (i > 0 && sorted[i - 1] == index) || self.is_free(index) {
                return Err(AllocError::DoubleFree(index));
            }
        }

        // Insert maximal runs so merging happens once per run
        let mut run: Option<(u32, u32)> = None;
        for index in sorted {
            run = match run {
                Some((start, end)) if end + 1 == index => Some((start, index)),
                Some((start, end)) => {
                    self.insert_range(start, end);
                    Some((index, index))
                }
                None => Some((index, index)),
            };
        }
        if let Some((start, end)) = run {
            self.insert_range(start, end);
        }

        log::debug!(
            "BLOCK_RANGES: released {} blocks, {} free total",
            indices.len(),
            self.free_blocks
        );
        Ok(())
    }

    /// Add `additional` free blocks at the end of the image
    pub fn grow(&mut self, additional: u32) -> Result<Option<BlockIndexRange>, AllocError> {
        if additional == 0 {
            return Ok(None);
        }
        let start = self.total_blocks;
        let new_total = start
            .checked_add(additional)
            .ok_or(AllocError::OutOfSpace {
                requested: u64::from(additional),
                available: self.free_blocks,
            })?;

        self.insert_range(start, new_total - 1);
        self.total_blocks = new_total;
        log::info!(
            "BLOCK_RANGES: grew image by {} blocks to {}",
            additional,
            new_total
        );
        Ok(BlockIndexRange::new(start, new_total - 1))
    }

    /// Insert a range known to be disjoint from the free set, merging neighbours
    fn insert_range(&mut self, mut start: u32, mut end: u32) {
        self.free_blocks += u64::from(end - start) + 1;

        let prev = self
            .free
            .range(..start)
            .next_back()
            .map(|(&prev_start, &prev_end)| (prev_start, prev_end));
        if let Some((prev_start, prev_end)) = prev {
            if prev_end + 1 == start {
                self.free.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(next_end) = end.checked_add(1).and_then(|next| self.free.remove(&next)) {
            end = next_end;
        }

        self.free.insert(start, end);
    }

    /// Check whether a block is free
    pub fn is_free(&self, index: u32) -> bool {
        self.free
            .range(..=index)
            .next_back()
            .map_or(false, |(_, &end)| index <= end)
    }

    /// Free ranges in ascending order
    pub fn free_ranges(&self) -> impl Iterator<Item = BlockIndexRange> + '_ {
        self.free
            .iter()
            .map(|(&min, &max)| BlockIndexRange { min, max })
    }

    /// Number of free blocks
    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    /// Number of blocks in the image
    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Number of allocated blocks
    pub fn used_blocks(&self) -> u64 {
        u64::from(self.total_blocks) - self.free_blocks
    }
}
