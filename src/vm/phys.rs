//! Physical Memory
//!
//! Backing store for the RAM described by the boot information. All kernel
//! access to physical memory (page tables, user data, boot images) goes
//! through these bounds-checked accessors.

use alloc::vec;
use alloc::vec::Vec;

use crate::kern::error::{KernError, KernResult};
use crate::types::PhysAddr;

#[derive(Debug)]
pub struct PhysMem {
    base: PhysAddr,
    bytes: Vec<u8>,
}

impl PhysMem {
    pub fn new(base: PhysAddr, size: usize) -> Self {
        Self {
            base,
            bytes: vec![0; size],
        }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Is `[pa, pa + len)` backed by RAM?
    pub fn contains(&self, pa: PhysAddr, len: usize) -> bool {
        pa >= self.base
            && pa
                .checked_add(len)
                .is_some_and(|end| end <= self.base + self.bytes.len())
    }

    fn range(&self, pa: PhysAddr, len: usize) -> KernResult<core::ops::Range<usize>> {
        if !self.contains(pa, len) {
            return Err(KernError::Fault);
        }
        let off = pa - self.base;
        Ok(off..off + len)
    }

    pub fn read(&self, pa: PhysAddr, buf: &mut [u8]) -> KernResult<()> {
        let range = self.range(pa, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    pub fn write(&mut self, pa: PhysAddr, data: &[u8]) -> KernResult<()> {
        let range = self.range(pa, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn zero(&mut self, pa: PhysAddr, len: usize) -> KernResult<()> {
        let range = self.range(pa, len)?;
        self.bytes[range].fill(0);
        Ok(())
    }

    /// Copy within physical memory
    pub fn copy(&mut self, src: PhysAddr, dst: PhysAddr, len: usize) -> KernResult<()> {
        let from = self.range(src, len)?;
        let to = self.range(dst, len)?;
        self.bytes.copy_within(from, to.start);
        Ok(())
    }

    /// Read a page table entry
    ///
    /// Page tables are kernel-owned; an entry outside RAM is a kernel bug.
    pub(crate) fn read_u32(&self, pa: PhysAddr) -> u32 {
        let mut word = [0u8; 4];
        if self.read(pa, &mut word).is_err() {
            panic!("phys: page table access outside RAM at {:#x}", pa);
        }
        u32::from_le_bytes(word)
    }

    pub(crate) fn write_u32(&mut self, pa: PhysAddr, val: u32) {
        if self.write(pa, &val.to_le_bytes()).is_err() {
            panic!("phys: page table access outside RAM at {:#x}", pa);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        let mut mem = PhysMem::new(0x1000, 0x2000);
        assert!(mem.contains(0x1000, 0x2000));
        assert!(!mem.contains(0x1000, 0x2001));
        assert!(!mem.contains(0xfff, 1));
        assert!(!mem.contains(usize::MAX, 2));
        assert_eq!(mem.write(0x2ffe, &[1, 2, 3]), Err(KernError::Fault));
        mem.write(0x2ffd, &[1, 2, 3]).unwrap();
        mem.copy(0x2ffd, 0x1000, 3).unwrap();
        let mut buf = [0u8; 3];
        mem.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        mem.write_u32(0x1800, 0xdead_beef);
        assert_eq!(mem.read_u32(0x1800), 0xdead_beef);
    }
}
