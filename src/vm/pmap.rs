//! Physical Map - Page Table Management
//!
//! Two-level page tables in the i386 format, stored in physical memory: a
//! page directory of 1024 entries, each pointing to a page table of 1024
//! page entries. Page tables are allocated on demand when a mapping is
//! entered and released with the directory.
//!
//! Only the user half of the address space is described here. The kernel
//! reaches physical memory directly.

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::kern::error::KernResult;
use crate::kern::Kernel;
use crate::types::{PhysAddr, VirtAddr};
use crate::vm::{SegFlags, PAGE_SIZE};

const PGDIR_SHIFT: usize = 22;
const PAGE_SHIFT: usize = 12;
const NPTE: usize = 1024;
const PTE_ADDR_MASK: u32 = !0xfff;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Page directory and page table entry bits
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
    }
}

impl PteFlags {
    /// Entry bits for a segment with `flags`
    pub fn from_seg(flags: SegFlags) -> Self {
        let mut pte = Self::PRESENT | Self::USER;
        if flags.contains(SegFlags::WRITE) {
            pte |= Self::WRITE;
        }
        pte
    }
}

fn pgd_index(va: VirtAddr) -> usize {
    (va >> PGDIR_SHIFT) & (NPTE - 1)
}

fn pte_index(va: VirtAddr) -> usize {
    (va >> PAGE_SHIFT) & (NPTE - 1)
}

impl Kernel {
    /// Allocate an empty page directory
    pub(crate) fn pmap_create(&mut self) -> KernResult<PhysAddr> {
        let pgd = self.page_alloc(PAGE_SIZE)?;
        self.vm.phys.zero(pgd, PAGE_SIZE)?;
        Ok(pgd)
    }

    /// Release a page directory and all of its page tables
    pub(crate) fn pmap_destroy(&mut self, pgd: PhysAddr) {
        let tables: Vec<PhysAddr> = (0..NPTE)
            .map(|i| self.vm.phys.read_u32(pgd + i * 4))
            .filter(|pde| pde & PteFlags::PRESENT.bits() != 0)
            .map(|pde| (pde & PTE_ADDR_MASK) as PhysAddr)
            .collect();
        for table in tables {
            self.page_free(table, PAGE_SIZE);
        }
        self.page_free(pgd, PAGE_SIZE);
    }

    /// Map `[va, va + size)` to `[pa, pa + size)`
    pub(crate) fn pmap_map(
        &mut self,
        pgd: PhysAddr,
        pa: PhysAddr,
        va: VirtAddr,
        size: usize,
        flags: PteFlags,
    ) -> KernResult<()> {
        for off in (0..size).step_by(PAGE_SIZE) {
            let va = va + off;
            let pde_addr = pgd + pgd_index(va) * 4;
            let mut pde = self.vm.phys.read_u32(pde_addr);
            if pde & PteFlags::PRESENT.bits() == 0 {
                let table = self.page_alloc(PAGE_SIZE)?;
                self.vm.phys.zero(table, PAGE_SIZE)?;
                pde = table as u32 | (PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER).bits();
                self.vm.phys.write_u32(pde_addr, pde);
            }
            let pte_addr = (pde & PTE_ADDR_MASK) as PhysAddr + pte_index(va) * 4;
            self.vm.phys.write_u32(pte_addr, (pa + off) as u32 | flags.bits());
        }
        Ok(())
    }

    /// Remove the mappings of `[va, va + size)`
    ///
    /// Page tables stay allocated until the directory is destroyed.
    pub(crate) fn pmap_unmap(&mut self, pgd: PhysAddr, va: VirtAddr, size: usize) {
        for off in (0..size).step_by(PAGE_SIZE) {
            let va = va + off;
            let pde = self.vm.phys.read_u32(pgd + pgd_index(va) * 4);
            if pde & PteFlags::PRESENT.bits() != 0 {
                let pte_addr = (pde & PTE_ADDR_MASK) as PhysAddr + pte_index(va) * 4;
                self.vm.phys.write_u32(pte_addr, 0);
            }
        }
    }

    /// Look up the page entry for `va`
    pub(crate) fn pmap_lookup(&self, pgd: PhysAddr, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
        let pde = self.vm.phys.read_u32(pgd + pgd_index(va) * 4);
        if pde & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        let pte = self
            .vm
            .phys
            .read_u32((pde & PTE_ADDR_MASK) as PhysAddr + pte_index(va) * 4);
        if pte & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        let pa = (pte & PTE_ADDR_MASK) as PhysAddr + (va & (PAGE_SIZE - 1));
        Some((pa, PteFlags::from_bits_truncate(pte)))
    }
}
