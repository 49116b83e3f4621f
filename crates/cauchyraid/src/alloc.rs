//! Per-drive position allocator.
//!
//! Each data drive owns an independent 32-bit position namespace: a bump
//! watermark (`next_free`) plus a sorted, non-adjacent list of free extents.

use crate::error::{Error, Result};

/// A contiguous run of free positions `[start, start + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: u32,
    pub count: u32,
}

/// Extent-based allocator over a flat 32-bit position namespace.
///
/// `extents` is kept sorted strictly by `start`, with no two entries
/// adjacent (adjacent runs are always merged) and no zero-count entries.
#[derive(Debug, Clone, Default)]
pub struct PositionAllocator {
    next_free: u32,
    extents: Vec<Extent>,
}

impl PositionAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_free(&self) -> u32 {
        self.next_free
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Restore allocator state as loaded from the content file.
    pub fn restore(next_free: u32, mut extents: Vec<Extent>) -> Self {
        extents.sort_by_key(|e| e.start);
        Self { next_free, extents }
    }

    /// Allocate `count` contiguous positions, first-fit over free extents,
    /// falling back to a bump of the watermark. `count == 0` is a pure probe
    /// that returns `next_free` without mutating anything.
    pub fn allocate(&mut self, count: u32) -> Result<u32> {
        if count == 0 {
            return Ok(self.next_free);
        }

        for i in 0..self.extents.len() {
            if self.extents[i].count >= count {
                let start = self.extents[i].start;
                self.extents[i].start += count;
                self.extents[i].count -= count;
                if self.extents[i].count == 0 {
                    self.extents.remove(i);
                }
                return Ok(start);
            }
        }

        let Some(next) = self.next_free.checked_add(count) else {
            log::error!("position namespace exhausted (next_free={}, count={count})", self.next_free);
            return Err(Error::NamespaceExhausted);
        };
        let start = self.next_free;
        self.next_free = next;
        Ok(start)
    }

    /// Free `[start, start + count)`, merging with adjacent extents and
    /// reclaiming the watermark if the trailing extent now abuts it.
    ///
    /// `count == 0` is a no-op. Double-free is not validated against; the
    /// caller is trusted not to double-free a live range.
    pub fn free(&mut self, start: u32, count: u32) {
        if count == 0 {
            return;
        }

        let i = self
            .extents
            .iter()
            .position(|e| e.start > start)
            .unwrap_or(self.extents.len());

        let merge_prev = i > 0 && {
            let p = self.extents[i - 1];
            p.start + p.count == start
        };
        let merge_next = i < self.extents.len() && {
            let n = self.extents[i];
            start + count == n.start
        };

        if merge_prev && merge_next {
            let next_count = self.extents[i].count;
            self.extents[i - 1].count += count + next_count;
            self.extents.remove(i);
        } else if merge_prev {
            self.extents[i - 1].count += count;
        } else if merge_next {
            self.extents[i].start = start;
            self.extents[i].count += count;
        } else {
            self.extents.insert(i, Extent { start, count });
        }

        if let Some(last) = self.extents.last().copied() {
            if last.start + last.count == self.next_free {
                self.next_free = last.start;
                self.extents.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_probe() {
        let mut a = PositionAllocator::new();
        assert_eq!(a.allocate(0).unwrap(), 0);
        assert_eq!(a.next_free(), 0);
        assert_eq!(a.allocate(5).unwrap(), 0);
        assert_eq!(a.next_free(), 5);
    }

    #[test]
    fn free_coalescing_collapses_to_empty() {
        let mut a = PositionAllocator::new();
        assert_eq!(a.allocate(9).unwrap(), 0);
        assert_eq!(a.next_free(), 9);

        a.free(0, 3);
        assert_eq!(a.extents(), &[Extent { start: 0, count: 3 }]);

        a.free(6, 3);
        assert_eq!(a.next_free(), 6);
        assert_eq!(a.extents(), &[Extent { start: 0, count: 3 }]);

        a.free(3, 3);
        assert_eq!(a.next_free(), 0);
        assert!(a.extents().is_empty());
    }

    #[test]
    fn first_fit_reuses_free_extent_before_bumping() {
        let mut a = PositionAllocator::new();
        a.allocate(10).unwrap();
        a.free(2, 4);
        assert_eq!(a.allocate(4).unwrap(), 2);
        assert_eq!(a.next_free(), 10);
        assert!(a.extents().is_empty());
    }

    #[test]
    fn extent_shrinks_on_partial_allocate() {
        let mut a = PositionAllocator::new();
        a.allocate(10).unwrap();
        a.free(0, 5);
        assert_eq!(a.allocate(2).unwrap(), 0);
        assert_eq!(a.extents(), &[Extent { start: 2, count: 3 }]);
    }

    #[test]
    fn free_with_zero_count_is_noop() {
        let mut a = PositionAllocator::new();
        a.allocate(5).unwrap();
        a.free(0, 0);
        assert_eq!(a.next_free(), 5);
        assert!(a.extents().is_empty());
    }

    #[test]
    fn namespace_exhaustion_errs() {
        let mut a = PositionAllocator::restore(u32::MAX - 2, Vec::new());
        assert!(matches!(a.allocate(10), Err(Error::NamespaceExhausted)));
        // small allocations that fit still succeed
        assert_eq!(a.allocate(2).unwrap(), u32::MAX - 2);
    }

    #[test]
    fn save_load_round_trip_conserves_state() {
        let mut a = PositionAllocator::new();
        a.allocate(20).unwrap();
        a.free(4, 3);
        a.free(10, 2);

        let restored = PositionAllocator::restore(a.next_free(), a.extents().to_vec());
        assert_eq!(restored.next_free(), a.next_free());
        assert_eq!(restored.extents(), a.extents());
    }
}
