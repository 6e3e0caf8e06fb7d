//! Physical Page Allocator
//!
//! Tracks free physical memory as an address-sorted list of free blocks.
//! Allocation is first fit and always in whole pages; freed blocks are
//! merged with their neighbours so the list never holds two adjacent
//! blocks. The VM manager and kernel stacks are its only clients.

use alloc::vec::Vec;

use crate::kern::error::{KernError, KernResult};
use crate::kern::Kernel;
use crate::types::PhysAddr;
use crate::vm::{page_round, page_trunc, PAGE_SIZE};

/// A run of free pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    base: PhysAddr,
    size: usize,
}

impl FreeBlock {
    fn end(&self) -> PhysAddr {
        self.base + self.size
    }
}

/// Physical memory usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// Bytes under management
    pub total: usize,
    /// Bytes free
    pub free: usize,
}

#[derive(Debug)]
pub struct PageAlloc {
    /// Free blocks sorted by address
    free: Vec<FreeBlock>,
    total: usize,
    used: usize,
}

impl PageAlloc {
    /// A page allocator managing `[base, base + size)`, all free
    pub fn new(base: PhysAddr, size: usize) -> Self {
        let base = page_round(base);
        let size = page_trunc(size);
        let mut free = Vec::new();
        if size > 0 {
            free.push(FreeBlock { base, size });
        }
        Self {
            free,
            total: size,
            used: 0,
        }
    }

    /// Allocate `size` bytes (rounded up to pages)
    pub fn alloc(&mut self, size: usize) -> Option<PhysAddr> {
        let size = page_round(size);
        if size == 0 {
            return None;
        }
        let idx = self.free.iter().position(|b| b.size >= size)?;
        let block = &mut self.free[idx];
        let addr = block.base;
        block.base += size;
        block.size -= size;
        if block.size == 0 {
            self.free.remove(idx);
        }
        self.used += size;
        Some(addr)
    }

    /// Return pages to the free list
    ///
    /// Freeing memory that is already free is a kernel bug.
    pub fn free(&mut self, addr: PhysAddr, size: usize) {
        let size = page_round(size);
        if addr % PAGE_SIZE != 0 || size == 0 {
            panic!("page_free: bad block {:#x}+{:#x}", addr, size);
        }
        let end = addr + size;
        let idx = self.free.partition_point(|b| b.base < addr);

        let overlaps_prev = idx > 0 && self.free[idx - 1].end() > addr;
        let overlaps_next = idx < self.free.len() && self.free[idx].base < end;
        if overlaps_prev || overlaps_next {
            log::error!("page_free: {:#x}+{:#x} is already free", addr, size);
            panic!("page_free: double free at {:#x}", addr);
        }

        let merge_prev = idx > 0 && self.free[idx - 1].end() == addr;
        let merge_next = idx < self.free.len() && self.free[idx].base == end;
        match (merge_prev, merge_next) {
            (true, true) => {
                let next = self.free.remove(idx);
                self.free[idx - 1].size += size + next.size;
            }
            (true, false) => self.free[idx - 1].size += size,
            (false, true) => {
                self.free[idx].base = addr;
                self.free[idx].size += size;
            }
            (false, false) => self.free.insert(idx, FreeBlock { base: addr, size }),
        }
        self.used -= size;
    }

    /// Take a specific range out of the free list
    ///
    /// Fails unless the whole range is currently free.
    pub fn reserve(&mut self, addr: PhysAddr, size: usize) -> KernResult<()> {
        let start = page_trunc(addr);
        let end = page_round(addr + size);
        let idx = self
            .free
            .iter()
            .position(|b| b.base <= start && b.end() >= end)
            .ok_or(KernError::InvalidArgument)?;
        let block = self.free[idx];
        self.free.remove(idx);
        if end < block.end() {
            self.free.insert(idx, FreeBlock { base: end, size: block.end() - end });
        }
        if block.base < start {
            self.free.insert(idx, FreeBlock { base: block.base, size: start - block.base });
        }
        self.used += end - start;
        Ok(())
    }

    pub fn info(&self) -> PageInfo {
        PageInfo {
            total: self.total,
            free: self.total - self.used,
        }
    }

    /// Is the range entirely free?
    pub fn is_free(&self, addr: PhysAddr, size: usize) -> bool {
        self.free.iter().any(|b| b.base <= addr && b.end() >= addr + size)
    }

    /// Sum of the free list, for consistency checks
    pub(crate) fn free_bytes(&self) -> usize {
        self.free.iter().map(|b| b.size).sum()
    }

    /// Free list is sorted with no touching or overlapping blocks
    pub(crate) fn is_coalesced(&self) -> bool {
        self.free.windows(2).all(|w| w[0].end() < w[1].base)
    }
}

impl Kernel {
    /// Allocate physical pages
    pub fn page_alloc(&mut self, size: usize) -> KernResult<PhysAddr> {
        match self.vm.pages.alloc(size) {
            Some(addr) => {
                log::trace!("page_alloc: {:#x}+{:#x}", addr, size);
                Ok(addr)
            }
            None => {
                log::warn!("page_alloc: out of memory ({:#x} bytes)", size);
                Err(KernError::ResourceExhausted)
            }
        }
    }

    /// Free physical pages
    pub fn page_free(&mut self, addr: PhysAddr, size: usize) {
        self.vm.pages.free(addr, size);
    }

    /// Reserve a physical range (boot modules, firmware)
    pub fn page_reserve(&mut self, addr: PhysAddr, size: usize) -> KernResult<()> {
        self.vm.pages.reserve(addr, size)
    }

    /// Physical memory usage
    pub fn page_info(&self) -> PageInfo {
        self.vm.pages.info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BASE: PhysAddr = 0x10_0000;

    #[test]
    fn test_first_fit_and_merge() {
        let mut pages = PageAlloc::new(BASE, 16 * PAGE_SIZE);
        let a = pages.alloc(PAGE_SIZE).unwrap();
        let b = pages.alloc(2 * PAGE_SIZE).unwrap();
        let c = pages.alloc(1).unwrap();
        assert_eq!((a, b, c), (BASE, BASE + PAGE_SIZE, BASE + 3 * PAGE_SIZE));
        assert_eq!(pages.info().free, 12 * PAGE_SIZE);

        pages.free(b, 2 * PAGE_SIZE);
        assert_eq!(pages.alloc(PAGE_SIZE), Some(b));
        pages.free(b, PAGE_SIZE);
        pages.free(a, PAGE_SIZE);
        pages.free(c, PAGE_SIZE);
        assert_eq!(pages.free, [FreeBlock { base: BASE, size: 16 * PAGE_SIZE }]);
    }

    #[test]
    fn test_exhaustion() {
        let mut pages = PageAlloc::new(BASE, 2 * PAGE_SIZE);
        assert!(pages.alloc(3 * PAGE_SIZE).is_none());
        assert!(pages.alloc(2 * PAGE_SIZE).is_some());
        assert!(pages.alloc(PAGE_SIZE).is_none());
    }

    #[test]
    fn test_reserve_splits_block() {
        let mut pages = PageAlloc::new(BASE, 8 * PAGE_SIZE);
        pages.reserve(BASE + 2 * PAGE_SIZE, PAGE_SIZE + 10).unwrap();
        assert_eq!(pages.info().free, 6 * PAGE_SIZE);
        assert!(!pages.is_free(BASE + 3 * PAGE_SIZE, PAGE_SIZE));
        assert!(pages.is_free(BASE + 4 * PAGE_SIZE, PAGE_SIZE));
        assert_eq!(pages.reserve(BASE + 2 * PAGE_SIZE, PAGE_SIZE), Err(KernError::InvalidArgument));
        assert!(pages.is_coalesced());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut pages = PageAlloc::new(BASE, 4 * PAGE_SIZE);
        let a = pages.alloc(PAGE_SIZE).unwrap();
        pages.free(a, PAGE_SIZE);
        pages.free(a, PAGE_SIZE);
    }

    proptest! {
        #[test]
        fn prop_alloc_free_conserves_memory(ops in proptest::collection::vec((0usize..4, 1usize..4), 1..64)) {
            let mut pages = PageAlloc::new(BASE, 32 * PAGE_SIZE);
            let mut held: Vec<(PhysAddr, usize)> = Vec::new();
            for (op, npages) in ops {
                if op == 0 && !held.is_empty() {
                    let (addr, size) = held.swap_remove(npages % held.len());
                    pages.free(addr, size);
                } else if let Some(addr) = pages.alloc(npages * PAGE_SIZE) {
                    for (a, s) in &held {
                        prop_assert!(addr + npages * PAGE_SIZE <= *a || a + s <= addr);
                    }
                    held.push((addr, npages * PAGE_SIZE));
                }
                let used: usize = held.iter().map(|(_, s)| s).sum();
                prop_assert_eq!(pages.free_bytes(), 32 * PAGE_SIZE - used);
                prop_assert_eq!(pages.info().free, 32 * PAGE_SIZE - used);
                prop_assert!(pages.is_coalesced());
            }
        }
    }
}
