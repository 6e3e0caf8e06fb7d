//! User Memory Access
//!
//! The kernel never dereferences a user address. Every access to task
//! memory is translated through the task's map into physical chunks first;
//! the whole range is validated before a single byte moves, so a failed
//! copy has no partial effect.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::kern::error::{KernError, KernResult};
use crate::kern::Kernel;
use crate::types::{MapId, PhysAddr, TaskId, VirtAddr};
use crate::vm::pmap::PteFlags;
use crate::vm::{SegFlags, VmMode, PAGE_SIZE};

impl Kernel {
    /// Translate `[addr, addr + len)` of `map` into physically contiguous
    /// chunks, checking write permission when `write` is set
    pub(crate) fn umem_chunks(
        &self,
        map: MapId,
        addr: VirtAddr,
        len: usize,
        write: bool,
    ) -> KernResult<Vec<(PhysAddr, usize)>> {
        let end = addr.checked_add(len).ok_or(KernError::Fault)?;
        if len > 0 && (!self.user_area(addr) || end > self.vm.user_max) {
            return Err(KernError::Fault);
        }

        let mut chunks: Vec<(PhysAddr, usize)> = Vec::new();
        let mut va = addr;
        while va < end {
            let (pa, n) = match (self.vm.mode, self.vm.maps[map].pgd) {
                (VmMode::Paged, Some(pgd)) => {
                    let (pa, flags) = self.pmap_lookup(pgd, va).ok_or(KernError::Fault)?;
                    if write && !flags.contains(PteFlags::WRITE) {
                        return Err(KernError::Fault);
                    }
                    let page_end = (va & !(PAGE_SIZE - 1)) + PAGE_SIZE;
                    (pa, page_end.min(end) - va)
                }
                _ => {
                    let id = self.seg_lookup(map, va, 1).ok_or(KernError::Fault)?;
                    let seg = &self.vm.segments[id];
                    if write && !seg.flags.contains(SegFlags::WRITE) {
                        return Err(KernError::Fault);
                    }
                    (seg.phys + (va - seg.addr), seg.end().min(end) - va)
                }
            };
            match chunks.last_mut() {
                Some((last, size)) if *last + *size == pa => *size += n,
                _ => chunks.push((pa, n)),
            }
            va += n;
        }
        Ok(chunks)
    }

    /// Chunks of a task range that are backed by RAM
    fn umem_ram(&self, task: TaskId, addr: VirtAddr, len: usize, write: bool) -> KernResult<Vec<(PhysAddr, usize)>> {
        let map = self.tasks.get(task).ok_or(KernError::InvalidArgument)?.map;
        let chunks = self.umem_chunks(map, addr, len, write)?;
        if chunks.iter().any(|(pa, n)| !self.vm.phys.contains(*pa, *n)) {
            return Err(KernError::Fault);
        }
        Ok(chunks)
    }

    /// Copy from a task's memory into a kernel buffer
    pub(crate) fn copy_from_task(&self, task: TaskId, addr: VirtAddr, buf: &mut [u8]) -> KernResult<()> {
        let chunks = self.umem_ram(task, addr, buf.len(), false)?;
        let mut off = 0;
        for (pa, n) in chunks {
            self.vm.phys.read(pa, &mut buf[off..off + n])?;
            off += n;
        }
        Ok(())
    }

    /// Copy a kernel buffer into a task's memory
    pub(crate) fn copy_to_task(&mut self, task: TaskId, addr: VirtAddr, data: &[u8]) -> KernResult<()> {
        let chunks = self.umem_ram(task, addr, data.len(), true)?;
        let mut off = 0;
        for (pa, n) in chunks {
            self.vm.phys.write(pa, &data[off..off + n])?;
            off += n;
        }
        Ok(())
    }

    /// Copy between two task address spaces
    ///
    /// Both ranges are validated before anything is written.
    pub(crate) fn copy_task_to_task(
        &mut self,
        src: TaskId,
        src_addr: VirtAddr,
        dst: TaskId,
        dst_addr: VirtAddr,
        len: usize,
    ) -> KernResult<()> {
        self.umem_ram(dst, dst_addr, len, true)?;
        let mut buf = vec![0u8; len];
        self.copy_from_task(src, src_addr, &mut buf)?;
        self.copy_to_task(dst, dst_addr, &buf)
    }

    /// Can the calling task read (or write) `[addr, addr + len)`?
    pub(crate) fn umem_check(&self, addr: VirtAddr, len: usize, write: bool) -> KernResult<()> {
        self.umem_ram(self.cur_task(), addr, len, write).map(|_| ())
    }

    /// Copy from the calling task
    pub fn copyin(&self, uaddr: VirtAddr, buf: &mut [u8]) -> KernResult<()> {
        self.copy_from_task(self.cur_task(), uaddr, buf)
    }

    /// Copy to the calling task
    pub fn copyout(&mut self, data: &[u8], uaddr: VirtAddr) -> KernResult<()> {
        self.copy_to_task(self.cur_task(), uaddr, data)
    }

    /// Read a NUL-terminated string of at most `max` bytes from the calling task
    pub fn copyinstr(&self, uaddr: VirtAddr, max: usize) -> KernResult<String> {
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if bytes.len() >= max {
                return Err(KernError::InvalidArgument);
            }
            self.copyin(uaddr + bytes.len(), &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }
        String::from_utf8(bytes).map_err(|_| KernError::InvalidArgument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil::*;

    #[test]
    fn test_copy_spans_pages_and_segments() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let a = k.vm_allocate(task, 0x10_0000, PAGE_SIZE, false).unwrap();
        k.vm_allocate(task, 0x10_1000, PAGE_SIZE, false).unwrap();
        let data: Vec<u8> = (0..64).collect();
        k.copy_to_task(task, a + PAGE_SIZE - 32, &data).unwrap();
        let mut back = [0u8; 64];
        k.copy_from_task(task, a + PAGE_SIZE - 32, &mut back).unwrap();
        assert_eq!(&back[..], &data[..]);
        let map = k.tasks[task].map;
        assert!(k.umem_chunks(map, a, 2 * PAGE_SIZE, false).unwrap().len() <= 2);
    }

    #[test]
    fn test_failed_copy_writes_nothing() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let a = k.vm_allocate(task, 0x10_0000, PAGE_SIZE, false).unwrap();
        let data = [0xaau8; 64];
        assert_eq!(k.copy_to_task(task, a + PAGE_SIZE - 32, &data), Err(KernError::Fault));
        let mut back = [1u8; 32];
        k.copy_from_task(task, a + PAGE_SIZE - 32, &mut back).unwrap();
        assert_eq!(back, [0; 32]);
        assert_eq!(k.copy_to_task(task, 0, &[1]), Err(KernError::Fault));
        assert_eq!(k.copy_to_task(task, usize::MAX, &[1, 2]), Err(KernError::Fault));
    }

    #[test]
    fn test_task_to_task_validates_destination_first() {
        let mut k = boot_default();
        let a = user_task(&mut k);
        let b = user_task(&mut k);
        let src = k.vm_allocate(a, 0, PAGE_SIZE, true).unwrap();
        let dst = k.vm_allocate(b, 0, PAGE_SIZE, true).unwrap();
        k.copy_to_task(a, src, b"ping").unwrap();
        k.copy_task_to_task(a, src, b, dst, 4).unwrap();
        let mut got = [0u8; 4];
        k.copy_from_task(b, dst, &mut got).unwrap();
        assert_eq!(&got, b"ping");

        k.vm_attribute(b, dst, SegFlags::READ).unwrap();
        assert_eq!(k.copy_task_to_task(a, src, b, dst, 4), Err(KernError::Fault));
    }

    #[test]
    fn test_copyinstr_bounds() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        spawn(&mut k, task, 100);
        k.preempt_point();
        let buf = k.vm_allocate(task, 0, PAGE_SIZE, true).unwrap();
        k.copyout(b"svc\0", buf).unwrap();
        assert_eq!(k.copyinstr(buf, 16).as_deref(), Ok("svc"));
        assert_eq!(k.copyinstr(buf, 3), Err(KernError::InvalidArgument));
        assert_eq!(k.copyinstr(buf + PAGE_SIZE, 16), Err(KernError::Fault));
    }
}
