/*!
 * Isolated Identity Allocation
 *
 * Two allocators share one design: a flat cyclic allocator hands out single
 * identities from a contiguous range, and a range allocator hands out whole
 * fixed-size blocks keyed by (process name, owner), tracked by a bitmap.
 */

use crate::core::types::PrincipalId;
use std::collections::{HashMap, HashSet};

/// Hands out individual identities from `[first, last]`, scanning forward
/// from a rotating cursor and skipping values still in use.
#[derive(Debug, Clone)]
pub struct CyclicIdRange {
    first: u32,
    last: u32,
    next: u32,
    used: HashSet<u32>,
}

impl CyclicIdRange {
    #[must_use]
    pub fn new(first: u32, last: u32) -> Self {
        debug_assert!(first <= last);
        Self {
            first,
            last,
            next: first,
            used: HashSet::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn first(&self) -> u32 {
        self.first
    }

    #[inline]
    #[must_use]
    pub const fn last(&self) -> u32 {
        self.last
    }

    /// Allocate the next free identity, or `None` when the range is
    /// exhausted. Scans at most the full range once.
    pub fn allocate(&mut self) -> Option<u32> {
        let span = self.last - self.first + 1;
        for _ in 0..span {
            if self.next < self.first || self.next > self.last {
                self.next = self.first;
            }
            let candidate = self.next;
            self.next += 1;
            if self.used.insert(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub fn free(&mut self, id: u32) {
        self.used.remove(&id);
    }

    #[inline]
    #[must_use]
    pub fn in_use(&self, id: u32) -> bool {
        self.used.contains(&id)
    }

    #[inline]
    #[must_use]
    pub fn used_count(&self) -> usize {
        self.used.len()
    }
}

/// Partitions `[first, last]` into fixed-size blocks and hands a whole block
/// to each (process name, owner) caller, reusing the existing block for
/// repeat callers. Freed blocks return to the bitmap only on explicit
/// release.
#[derive(Debug)]
pub struct IdBlockAllocator {
    first: u32,
    ids_per_block: u32,
    /// One bit per block; true = free
    free_blocks: Vec<bool>,
    assigned: HashMap<(String, PrincipalId), CyclicIdRange>,
}

impl IdBlockAllocator {
    #[must_use]
    pub fn new(first: u32, last: u32, ids_per_block: u32) -> Self {
        debug_assert!(ids_per_block > 0);
        let blocks = ((last - first + 1) / ids_per_block) as usize;
        Self {
            first,
            ids_per_block,
            free_blocks: vec![true; blocks],
            assigned: HashMap::new(),
        }
    }

    /// The block already assigned to this caller, if any
    #[must_use]
    pub fn get(&mut self, name: &str, owner: PrincipalId) -> Option<&mut CyclicIdRange> {
        self.assigned.get_mut(&(name.to_string(), owner))
    }

    /// The caller's block, allocating a fresh one from the bitmap if this is
    /// a first request. `None` when no block is free.
    pub fn get_or_create(&mut self, name: &str, owner: PrincipalId) -> Option<&mut CyclicIdRange> {
        let key = (name.to_string(), owner);
        if !self.assigned.contains_key(&key) {
            let block = self.free_blocks.iter().position(|&free| free)?;
            self.free_blocks[block] = false;
            let first = self.first + block as u32 * self.ids_per_block;
            let range = CyclicIdRange::new(first, first + self.ids_per_block - 1);
            self.assigned.insert(key.clone(), range);
        }
        self.assigned.get_mut(&key)
    }

    /// Return the caller's block to the free bitmap
    pub fn release(&mut self, name: &str, owner: PrincipalId) {
        if let Some(range) = self.assigned.remove(&(name.to_string(), owner)) {
            let block = ((range.first() - self.first) / self.ids_per_block) as usize;
            self.free_blocks[block] = true;
        }
    }

    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.free_blocks.iter().filter(|&&free| free).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cyclic_allocates_unique_until_exhausted() {
        let mut range = CyclicIdRange::new(10, 14);
        let mut seen = HashSet::new();
        for _ in 0..5 {
            let id = range.allocate().unwrap();
            assert!(seen.insert(id));
            assert!((10..=14).contains(&id));
        }
        assert_eq!(range.allocate(), None);
    }

    #[test]
    fn cyclic_reuses_freed_ids_after_wrap() {
        let mut range = CyclicIdRange::new(0, 2);
        let a = range.allocate().unwrap();
        let _b = range.allocate().unwrap();
        let _c = range.allocate().unwrap();
        range.free(a);
        assert_eq!(range.allocate(), Some(a));
        assert_eq!(range.allocate(), None);
    }

    #[test]
    fn block_allocator_reuses_block_for_repeat_caller() {
        let mut alloc = IdBlockAllocator::new(1000, 1999, 100);
        let first = alloc.get_or_create("worker.a", 1).unwrap().first();
        let again = alloc.get_or_create("worker.a", 1).unwrap().first();
        assert_eq!(first, again);
        let other = alloc.get_or_create("worker.b", 1).unwrap().first();
        assert_ne!(first, other);
    }

    #[test]
    fn block_allocator_exhausts_and_releases() {
        let mut alloc = IdBlockAllocator::new(0, 199, 100);
        alloc.get_or_create("a", 1).unwrap();
        alloc.get_or_create("b", 1).unwrap();
        assert!(alloc.get_or_create("c", 1).is_none());
        alloc.release("a", 1);
        assert_eq!(alloc.free_block_count(), 1);
        assert!(alloc.get_or_create("c", 1).is_some());
    }

    #[test]
    fn blocks_never_overlap() {
        let mut alloc = IdBlockAllocator::new(0, 399, 100);
        let mut firsts = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let range = alloc.get_or_create(name, 7).unwrap();
            firsts.push((range.first(), range.last()));
        }
        for (i, a) in firsts.iter().enumerate() {
            for b in &firsts[i + 1..] {
                assert!(a.1 < b.0 || b.1 < a.0);
            }
        }
    }
}
