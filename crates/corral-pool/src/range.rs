//! Numeric range pool for uids and host ports.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use corral_common::config::RangeConfig;
use corral_common::error::{CorralError, Result};
use serde::{Deserialize, Serialize};

/// A contiguous block `[start, start + size)` of ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdRange {
    /// First id of the block.
    pub start: u32,
    /// Number of ids in the block.
    pub size: u32,
}

impl IdRange {
    /// One past the last id, widened so it cannot overflow.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start as u64 + self.size as u64
    }

    /// Returns whether the two blocks share at least one id.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        (self.start as u64) < other.end() && (other.start as u64) < self.end()
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// Hands out fixed-size blocks of a numeric range.
///
/// Freed blocks go to the back of the queue, so a block is reused as late
/// as possible. That keeps a port from being handed to a new container
/// while connections of its previous owner may still linger.
#[derive(Debug, Clone)]
pub struct RangePool {
    name: &'static str,
    start: u32,
    block: u32,
    blocks: u32,
    free: VecDeque<u32>,
    issued: BTreeSet<u32>,
}

impl RangePool {
    /// Builds a pool from configured bounds.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error when the block size is zero, the range cannot
    /// hold a single block, or the range does not fit in `u32`.
    pub fn new(name: &'static str, config: RangeConfig) -> Result<Self> {
        if config.block == 0 {
            return Err(CorralError::Config {
                message: format!("{name} pool block size must be positive"),
            });
        }
        if u64::from(config.start) + u64::from(config.size) > u64::from(u32::MAX) + 1 {
            return Err(CorralError::Config {
                message: format!(
                    "{name} pool [{}, +{}) exceeds the 32-bit id space",
                    config.start, config.size
                ),
            });
        }
        let blocks = config.size / config.block;
        if blocks == 0 {
            return Err(CorralError::Config {
                message: format!(
                    "{name} pool of size {} cannot hold a block of {}",
                    config.size, config.block
                ),
            });
        }
        Ok(Self {
            name,
            start: config.start,
            block: config.block,
            blocks,
            free: (0..blocks).collect(),
            issued: BTreeSet::new(),
        })
    }

    /// Name used in errors and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Total number of blocks.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.blocks as usize
    }

    /// Number of blocks not currently issued.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Currently free blocks, ordered by start.
    #[must_use]
    pub fn free_blocks(&self) -> Vec<IdRange> {
        let mut blocks: Vec<_> = self.free.iter().map(|&i| self.range_of(i)).collect();
        blocks.sort_unstable();
        blocks
    }

    /// Issues the next free block, or `None` when exhausted.
    pub fn acquire(&mut self) -> Option<IdRange> {
        let index = self.free.pop_front()?;
        let _ = self.issued.insert(index);
        Some(self.range_of(index))
    }

    /// Issues the block starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `start` is not a block boundary of this pool and
    /// `ResourceConflict` if the block is already issued.
    pub fn acquire_at(&mut self, start: u32) -> Result<IdRange> {
        let range = IdRange {
            start,
            size: self.block,
        };
        self.reserve(range)?;
        Ok(range)
    }

    /// Checks that `range` is a free block of this pool without issuing it.
    ///
    /// # Errors
    ///
    /// As for [`RangePool::reserve`].
    pub fn check_free(&self, range: IdRange) -> Result<()> {
        let index = self.index_of(range)?;
        if self.issued.contains(&index) {
            return Err(CorralError::ResourceConflict {
                message: format!("{} block {range} is already in use", self.name),
            });
        }
        Ok(())
    }

    /// Marks an exact block as issued.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `range` is not one of this pool's blocks and
    /// `ResourceConflict` if it is already issued.
    pub fn reserve(&mut self, range: IdRange) -> Result<()> {
        self.check_free(range)?;
        let index = self.index_of(range)?;
        self.free.retain(|&i| i != index);
        let _ = self.issued.insert(index);
        Ok(())
    }

    /// Returns a block to the pool. Returns `false`, changing nothing, if the
    /// block was not issued by this pool.
    pub fn release(&mut self, range: IdRange) -> bool {
        let Ok(index) = self.index_of(range) else {
            return false;
        };
        if !self.issued.remove(&index) {
            return false;
        }
        self.free.push_back(index);
        true
    }

    /// Returns whether `range` is currently issued.
    #[must_use]
    pub fn is_issued(&self, range: IdRange) -> bool {
        self.index_of(range)
            .is_ok_and(|index| self.issued.contains(&index))
    }

    fn range_of(&self, index: u32) -> IdRange {
        IdRange {
            start: self.start + index * self.block,
            size: self.block,
        }
    }

    fn index_of(&self, range: IdRange) -> Result<u32> {
        let offset = range.start.checked_sub(self.start);
        match offset {
            Some(offset)
                if range.size == self.block
                    && offset % self.block == 0
                    && offset / self.block < self.blocks =>
            {
                Ok(offset / self.block)
            }
            _ => Err(CorralError::Config {
                message: format!("{range} is not a {} block of this pool", self.name),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(start: u32, size: u32, block: u32) -> RangePool {
        RangePool::new("uid", RangeConfig { start, size, block }).unwrap()
    }

    #[test]
    fn blocks_are_issued_in_order() {
        let mut p = pool(10_000, 4, 1);
        assert_eq!(p.acquire().unwrap(), IdRange { start: 10_000, size: 1 });
        assert_eq!(p.acquire().unwrap(), IdRange { start: 10_001, size: 1 });
        assert_eq!(p.available(), 2);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let mut p = pool(61_001, 1, 1);
        assert!(p.acquire().is_some());
        assert!(p.acquire().is_none());
    }

    #[test]
    fn released_blocks_are_reused_last() {
        let mut p = pool(0, 3, 1);
        let first = p.acquire().unwrap();
        assert!(p.release(first));
        assert_eq!(p.acquire().unwrap().start, 1);
        assert_eq!(p.acquire().unwrap().start, 2);
        assert_eq!(p.acquire().unwrap().start, 0);
    }

    #[test]
    fn multi_id_blocks() {
        let mut p = pool(100_000, 10, 4);
        assert_eq!(p.capacity(), 2);
        let a = p.acquire().unwrap();
        let b = p.acquire().unwrap();
        assert_eq!(a, IdRange { start: 100_000, size: 4 });
        assert_eq!(b, IdRange { start: 100_004, size: 4 });
        assert!(!a.overlaps(&b));
        assert!(p.acquire().is_none());
    }

    #[test]
    fn releasing_unissued_block_changes_nothing() {
        let mut p = pool(0, 2, 1);
        assert!(!p.release(IdRange { start: 1, size: 1 }));
        assert!(!p.release(IdRange { start: 7, size: 1 }));
        assert_eq!(p.available(), 2);
    }

    #[test]
    fn reserve_rejects_issued_and_foreign_blocks() {
        let mut p = pool(0, 8, 2);
        p.reserve(IdRange { start: 2, size: 2 }).unwrap();
        assert!(matches!(
            p.reserve(IdRange { start: 2, size: 2 }),
            Err(CorralError::ResourceConflict { .. })
        ));
        assert!(matches!(
            p.reserve(IdRange { start: 3, size: 2 }),
            Err(CorralError::Config { .. })
        ));
        assert!(matches!(
            p.reserve(IdRange { start: 8, size: 2 }),
            Err(CorralError::Config { .. })
        ));
        assert_eq!(p.available(), 3);
    }

    #[test]
    fn acquire_skips_reserved_block() {
        let mut p = pool(0, 2, 1);
        let _ = p.acquire_at(0).unwrap();
        assert_eq!(p.acquire().unwrap().start, 1);
    }

    #[test]
    fn invalid_bounds_are_config_errors() {
        assert!(RangePool::new("port", RangeConfig { start: 1, size: 0, block: 1 }).is_err());
        assert!(RangePool::new("port", RangeConfig { start: 1, size: 4, block: 0 }).is_err());
        assert!(RangePool::new("port", RangeConfig { start: 1, size: 2, block: 4 }).is_err());
        assert!(RangePool::new("uid", RangeConfig { start: u32::MAX, size: 2, block: 1 }).is_err());
    }

    #[test]
    fn overlap_detection() {
        let a = IdRange { start: 0, size: 4 };
        assert!(a.overlaps(&IdRange { start: 3, size: 1 }));
        assert!(!a.overlaps(&IdRange { start: 4, size: 1 }));
    }
}
