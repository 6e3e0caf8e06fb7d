//! VM Map - Address Space Management
//!
//! A map's segment list covers its whole user range. Allocation carves a
//! reserved segment out of a free hole (splitting it as needed); freeing
//! turns the segment back into a hole and merges it with free neighbours.
//! Allocated segments therefore never overlap, and no segment is empty.
//!
//! Every segment is in one of four ownership states:
//!
//! - owned: backed by pages this map allocated and frees
//! - shared: pages owned jointly by the members of a share group
//! - mapped: an alias of memory the allocator does not own (device
//!   registers, frame buffers); never freed through this map
//! - free: a hole

use alloc::vec;
use alloc::vec::Vec;

use crate::boot::ModuleImage;
use crate::kern::cap::Capabilities;
use crate::kern::error::{KernError, KernResult};
use crate::kern::queue::{QueueChain, QueueHead};
use crate::kern::Kernel;
use crate::types::{MapId, PhysAddr, SegmentId, TaskId, VirtAddr};
use crate::vm::pmap::PteFlags;
use crate::vm::{page_round, page_trunc, Segment, SegFlags, ShareGroup, VmMap, VmMode, PAGE_SIZE};

/// Description of an allocated segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegInfo {
    pub addr: VirtAddr,
    pub size: usize,
    pub flags: SegFlags,
    pub phys: PhysAddr,
}

impl SegInfo {
    fn of(seg: &Segment) -> Self {
        Self {
            addr: seg.addr,
            size: seg.size,
            flags: seg.flags,
            phys: seg.phys,
        }
    }
}

impl Kernel {
    // ========================================================================
    // Segment list
    // ========================================================================

    fn seg_new(&mut self, map: MapId, addr: VirtAddr, size: usize, flags: SegFlags) -> KernResult<SegmentId> {
        self.vm.segments.alloc(Segment {
            map,
            addr,
            size,
            phys: 0,
            flags,
            share: None,
            link: QueueChain::new(),
        })
    }

    /// Allocated segment covering `[addr, addr + size)`
    pub(crate) fn seg_lookup(&self, map: MapId, addr: VirtAddr, size: usize) -> Option<SegmentId> {
        let vm = &self.vm;
        let end = addr.checked_add(size)?;
        let id = vm.maps[map]
            .segs
            .iter(&vm.segments)
            .find(|id| vm.segments[*id].addr <= addr && addr < vm.segments[*id].end())?;
        let seg = &vm.segments[id];
        (!seg.is_free() && end <= seg.end()).then_some(id)
    }

    /// Allocated segment starting exactly at `addr`
    fn seg_at(&self, map: MapId, addr: VirtAddr) -> KernResult<SegmentId> {
        self.seg_lookup(map, addr, 1)
            .filter(|id| self.vm.segments[*id].addr == addr)
            .ok_or(KernError::InvalidArgument)
    }

    /// Carve `[addr, addr + size)` out of a free hole
    ///
    /// The new segment is a placeholder (`MAPPED`, no pages) until backed.
    fn seg_reserve(&mut self, map: MapId, addr: VirtAddr, size: usize) -> KernResult<SegmentId> {
        let end = addr.checked_add(size).ok_or(KernError::InvalidArgument)?;
        let vm = &self.vm;
        let hole = vm.maps[map].segs.iter(&vm.segments).find(|id| {
            let seg = &vm.segments[*id];
            seg.is_free() && seg.addr <= addr && end <= seg.end()
        });
        let hole = match hole {
            Some(hole) => hole,
            None => {
                log::debug!("seg_reserve: {:#x}+{:#x} overlaps or is out of range", addr, size);
                return Err(KernError::InvalidArgument);
            }
        };
        let (hole_addr, hole_end) = (vm.segments[hole].addr, vm.segments[hole].end());

        let head = if hole_addr < addr {
            Some(self.seg_new(map, hole_addr, addr - hole_addr, SegFlags::FREE)?)
        } else {
            None
        };
        let tail = if end < hole_end {
            match self.seg_new(map, end, hole_end - end, SegFlags::FREE) {
                Ok(tail) => Some(tail),
                Err(err) => {
                    if let Some(head) = head {
                        self.vm.segments.free(head);
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };

        let vm = &mut self.vm;
        if let Some(head) = head {
            vm.maps[map].segs.insert_before(&mut vm.segments, hole, head);
        }
        if let Some(tail) = tail {
            vm.maps[map].segs.insert_after(&mut vm.segments, hole, tail);
        }
        let seg = &mut vm.segments[hole];
        seg.addr = addr;
        seg.size = size;
        seg.phys = 0;
        seg.flags = SegFlags::MAPPED;
        Ok(hole)
    }

    /// Reserve `size` bytes at the lowest free address
    fn seg_alloc(&mut self, map: MapId, size: usize) -> KernResult<SegmentId> {
        let vm = &self.vm;
        let addr = vm.maps[map]
            .segs
            .iter(&vm.segments)
            .map(|id| &vm.segments[id])
            .find(|seg| seg.is_free() && seg.size >= size)
            .map(|seg| seg.addr)
            .ok_or(KernError::ResourceExhausted)?;
        self.seg_reserve(map, addr, size)
    }

    /// Turn a segment back into a hole, merging with free neighbours
    fn seg_free(&mut self, map: MapId, id: SegmentId) {
        let vm = &mut self.vm;
        let seg = &mut vm.segments[id];
        if seg.share.is_some() {
            panic!("seg_free: {:?} still shared", id);
        }
        seg.flags = SegFlags::FREE;
        seg.phys = 0;

        if let Some(next) = vm.maps[map].segs.next(&vm.segments, id) {
            if vm.segments[next].is_free() {
                let size = vm.segments[next].size;
                vm.maps[map].segs.remove(&mut vm.segments, next);
                vm.segments.free(next);
                vm.segments[id].size += size;
            }
        }
        if let Some(prev) = vm.maps[map].segs.prev(&vm.segments, id) {
            if vm.segments[prev].is_free() {
                let size = vm.segments[id].size;
                vm.maps[map].segs.remove(&mut vm.segments, id);
                vm.segments.free(id);
                vm.segments[prev].size += size;
            }
        }
    }

    /// Drop a segment's claim on its pages
    fn seg_release(&mut self, id: SegmentId) {
        let seg = &self.vm.segments[id];
        let (flags, phys, size) = (seg.flags, seg.phys, seg.size);
        if flags.contains(SegFlags::SHARED) {
            self.seg_unshare(id);
        } else if !flags.contains(SegFlags::MAPPED) {
            self.page_free(phys, size);
        }
    }

    /// Put `dst` in the share group of `src`, creating the group if needed
    fn seg_share(&mut self, src: SegmentId, dst: SegmentId) -> KernResult<()> {
        let group = match self.vm.segments[src].share {
            Some(group) => group,
            None => {
                let group = self.vm.shares.alloc(ShareGroup { members: vec![src] })?;
                let seg = &mut self.vm.segments[src];
                seg.share = Some(group);
                seg.flags.insert(SegFlags::SHARED);
                group
            }
        };
        self.vm.shares[group].members.push(dst);
        let seg = &mut self.vm.segments[dst];
        seg.share = Some(group);
        seg.flags.insert(SegFlags::SHARED);
        Ok(())
    }

    /// Leave a share group; a last remaining member becomes sole owner
    fn seg_unshare(&mut self, id: SegmentId) {
        let vm = &mut self.vm;
        let group = match vm.segments[id].share.take() {
            Some(group) => group,
            None => panic!("seg_unshare: {:?} is not shared", id),
        };
        vm.segments[id].flags.remove(SegFlags::SHARED);
        let members = &mut vm.shares[group].members;
        members.retain(|m| *m != id);
        if let [last] = members[..] {
            vm.shares.free(group);
            let seg = &mut vm.segments[last];
            seg.share = None;
            seg.flags.remove(SegFlags::SHARED);
        }
    }

    /// Give a reserved segment its pages and enter it in the page tables
    ///
    /// On failure the caller discards the segment.
    fn seg_back(&mut self, map: MapId, id: SegmentId, phys: PhysAddr, flags: SegFlags) -> KernResult<()> {
        let seg = &mut self.vm.segments[id];
        seg.phys = phys;
        seg.flags = flags;
        let (addr, size) = (seg.addr, seg.size);
        self.vm.maps[map].total += size;
        if let Some(pgd) = self.vm.maps[map].pgd {
            self.pmap_map(pgd, phys, addr, size, PteFlags::from_seg(flags))?;
        }
        Ok(())
    }

    /// Unmap, release and free an allocated segment
    fn seg_discard(&mut self, map: MapId, id: SegmentId) {
        let seg = &self.vm.segments[id];
        let (addr, size) = (seg.addr, seg.size);
        if let Some(pgd) = self.vm.maps[map].pgd {
            self.pmap_unmap(pgd, addr, size);
        }
        self.seg_release(id);
        self.vm.maps[map].total -= size;
        self.seg_free(map, id);
    }

    /// Reserve a segment for `size` bytes backed by `phys`
    fn seg_place(&mut self, map: MapId, addr: Option<VirtAddr>, size: usize, phys: PhysAddr) -> KernResult<SegmentId> {
        match (self.vm.mode, addr) {
            (VmMode::Flat, _) => self.seg_reserve(map, phys, size),
            (VmMode::Paged, Some(addr)) => self.seg_reserve(map, addr, size),
            (VmMode::Paged, None) => self.seg_alloc(map, size),
        }
    }

    // ========================================================================
    // Map lifecycle
    // ========================================================================

    /// Create an empty map
    pub(crate) fn vm_create(&mut self) -> KernResult<MapId> {
        let pgd = match self.vm.mode {
            VmMode::Paged => Some(self.pmap_create()?),
            VmMode::Flat => None,
        };
        let map = VmMap {
            segs: QueueHead::new(),
            pgd,
            refcnt: 1,
            total: 0,
        };
        let map = match self.vm.maps.alloc(map) {
            Ok(map) => map,
            Err(err) => {
                if let Some(pgd) = pgd {
                    self.pmap_destroy(pgd);
                }
                return Err(err);
            }
        };
        let (min, max) = (self.vm.user_min, self.vm.user_max);
        match self.seg_new(map, min, max - min, SegFlags::FREE) {
            Ok(hole) => {
                let vm = &mut self.vm;
                vm.maps[map].segs.enqueue(&mut vm.segments, hole);
            }
            Err(err) => {
                self.vm.maps.free(map);
                if let Some(pgd) = pgd {
                    self.pmap_destroy(pgd);
                }
                return Err(err);
            }
        }
        log::trace!("vm_create: {:?}", map);
        Ok(map)
    }

    /// Add a reference to a map
    pub(crate) fn vm_reference(&mut self, map: MapId) {
        self.vm.maps[map].refcnt += 1;
    }

    /// Drop a reference; the last one frees the map and its memory
    pub(crate) fn vm_terminate(&mut self, map: MapId) {
        let m = &mut self.vm.maps[map];
        m.refcnt -= 1;
        if m.refcnt > 0 {
            return;
        }
        let segs: Vec<SegmentId> = m.segs.iter(&self.vm.segments).collect();
        for id in segs {
            if !self.vm.segments[id].is_free() {
                self.seg_release(id);
            }
            let vm = &mut self.vm;
            vm.maps[map].segs.remove(&mut vm.segments, id);
            vm.segments.free(id);
        }
        let pgd = match self.vm.maps.free(map) {
            Some(m) => m.pgd,
            None => panic!("vm_terminate: stale {:?}", map),
        };
        if let Some(pgd) = pgd {
            self.pmap_destroy(pgd);
        }
        if self.vm.active == Some(map) {
            self.vm.active = None;
        }
        log::trace!("vm_terminate: {:?} freed", map);
    }

    /// Duplicate a map for a child task
    ///
    /// Writable segments are copied, read-only and shared ones join a share
    /// group, mapped ones stay aliases of the same memory.
    pub(crate) fn vm_dup(&mut self, src: MapId) -> KernResult<MapId> {
        if self.vm.mode == VmMode::Flat {
            return Err(KernError::InvalidArgument);
        }
        let dst = self.vm_create()?;
        let vm = &self.vm;
        let segs: Vec<SegmentId> = vm.maps[src]
            .segs
            .iter(&vm.segments)
            .filter(|id| !vm.segments[*id].is_free())
            .collect();
        for id in segs {
            if let Err(err) = self.seg_dup(dst, id) {
                self.vm_terminate(dst);
                return Err(err);
            }
        }
        log::debug!("vm_dup: {:?} -> {:?}", src, dst);
        Ok(dst)
    }

    fn seg_dup(&mut self, dst: MapId, id: SegmentId) -> KernResult<()> {
        let seg = &self.vm.segments[id];
        let (addr, size, phys, flags) = (seg.addr, seg.size, seg.phys, seg.flags);
        let new = self.seg_reserve(dst, addr, size)?;

        let mapped = flags.contains(SegFlags::MAPPED);
        let copy = !mapped && !flags.contains(SegFlags::SHARED) && flags.contains(SegFlags::WRITE);
        if copy {
            let pages = self.page_alloc(size)?;
            if let Err(err) = self.vm.phys.copy(phys, pages, size) {
                self.page_free(pages, size);
                return Err(err);
            }
            self.seg_back(dst, new, pages, flags)
        } else if mapped {
            self.seg_back(dst, new, phys, flags)
        } else {
            self.seg_share(id, new)?;
            self.seg_back(dst, new, phys, flags | SegFlags::SHARED)
        }
    }

    /// Load `map` into the MMU
    pub(crate) fn vm_switch(&mut self, map: MapId) {
        self.vm.active = Some(map);
        self.vm.switches += 1;
        log::trace!("vm_switch: {:?}", map);
    }

    /// Is `addr` inside the user address range?
    pub fn user_area(&self, addr: VirtAddr) -> bool {
        addr >= self.vm.user_min && addr < self.vm.user_max
    }

    /// Map of `task`, for a caller allowed to touch its memory
    fn vm_task_map(&self, task: TaskId) -> KernResult<MapId> {
        let t = self.tasks.get(task).ok_or(KernError::InvalidArgument)?;
        if !t.active {
            return Err(KernError::InvalidState);
        }
        let map = t.map;
        if task != self.cur_task() {
            self.check_cap(Capabilities::EXTMEM)?;
        }
        Ok(map)
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Allocate zeroed memory in `task`
    ///
    /// With `anywhere` the kernel picks the address; otherwise `addr` must
    /// be page aligned and the range free. Fixed placement is not available
    /// without an MMU.
    pub fn vm_allocate(&mut self, task: TaskId, addr: VirtAddr, size: usize, anywhere: bool) -> KernResult<VirtAddr> {
        let map = self.vm_task_map(task)?;
        if size == 0 || size > self.vm.user_max || (!anywhere && addr % PAGE_SIZE != 0) {
            return Err(KernError::InvalidArgument);
        }
        if !anywhere && self.vm.mode == VmMode::Flat {
            return Err(KernError::InvalidArgument);
        }
        let size = page_round(size);

        let phys = self.page_alloc(size)?;
        self.vm.phys.zero(phys, size)?;
        let at = (!anywhere).then_some(addr);
        let id = match self.seg_place(map, at, size, phys) {
            Ok(id) => id,
            Err(err) => {
                self.page_free(phys, size);
                return Err(err);
            }
        };
        if let Err(err) = self.seg_back(map, id, phys, SegFlags::READ | SegFlags::WRITE) {
            self.seg_discard(map, id);
            return Err(err);
        }
        let addr = self.vm.segments[id].addr;
        log::debug!("vm_allocate: {:?} {:#x}+{:#x}", task, addr, size);
        Ok(addr)
    }

    /// Free the segment starting at `addr`
    pub fn vm_free(&mut self, task: TaskId, addr: VirtAddr) -> KernResult<()> {
        let map = self.vm_task_map(task)?;
        let id = self.seg_at(map, addr)?;
        self.seg_discard(map, id);
        log::debug!("vm_free: {:?} {:#x}", task, addr);
        Ok(())
    }

    /// Change the protection of the segment starting at `addr`
    ///
    /// A segment shared with other maps gets a private copy first.
    pub fn vm_attribute(&mut self, task: TaskId, addr: VirtAddr, attr: SegFlags) -> KernResult<()> {
        let map = self.vm_task_map(task)?;
        if attr.is_empty() || !SegFlags::PROT.contains(attr) {
            return Err(KernError::InvalidArgument);
        }
        let id = self.seg_at(map, addr)?;
        let seg = &self.vm.segments[id];
        if seg.flags.contains(SegFlags::MAPPED) {
            return Err(KernError::InvalidArgument);
        }
        if seg.flags & SegFlags::PROT == attr {
            return Ok(());
        }

        let size = seg.size;
        if seg.flags.contains(SegFlags::SHARED) {
            let old = seg.phys;
            let pages = self.page_alloc(size)?;
            if let Err(err) = self.vm.phys.copy(old, pages, size) {
                self.page_free(pages, size);
                return Err(err);
            }
            self.seg_unshare(id);
            self.vm.segments[id].phys = pages;
            log::debug!("vm_attribute: private copy of shared segment {:#x}", addr);
        }

        let seg = &mut self.vm.segments[id];
        seg.flags = (seg.flags - SegFlags::PROT) | attr;
        let (phys, flags) = (seg.phys, seg.flags);
        if let Some(pgd) = self.vm.maps[map].pgd {
            self.pmap_map(pgd, phys, addr, size, PteFlags::from_seg(flags))?;
        }
        Ok(())
    }

    /// Map physical memory (device registers, frame buffers) into `task`
    pub fn vm_map(&mut self, task: TaskId, phys: PhysAddr, size: usize) -> KernResult<VirtAddr> {
        self.check_cap(Capabilities::RAWIO)?;
        let map = self.vm_task_map(task)?;
        let end = phys.checked_add(size).ok_or(KernError::InvalidArgument)?;
        if size == 0 {
            return Err(KernError::InvalidArgument);
        }
        let base = page_trunc(phys);
        let len = page_round(end) - base;
        let id = self.seg_place(map, None, len, base)?;
        if let Err(err) = self.seg_back(map, id, base, SegFlags::READ | SegFlags::WRITE | SegFlags::MAPPED) {
            self.seg_discard(map, id);
            return Err(err);
        }
        Ok(self.vm.segments[id].addr + (phys - base))
    }

    /// Map part of another task's memory into the calling task
    ///
    /// The whole segment holding the range is mapped. The alias joins the
    /// segment's share group, so its pages stay allocated until every
    /// mapping of them is gone.
    pub fn vm_map_task(&mut self, target: TaskId, addr: VirtAddr, size: usize) -> KernResult<VirtAddr> {
        let tmap = self.vm_task_map(target)?;
        let map = self.tasks[self.cur_task()].map;
        let end = addr.checked_add(size).ok_or(KernError::InvalidArgument)?;
        if size == 0 {
            return Err(KernError::InvalidArgument);
        }
        let base = page_trunc(addr);
        let len = page_round(end) - base;
        let src = self.seg_lookup(tmap, base, len).ok_or(KernError::InvalidArgument)?;
        if map == tmap {
            return Ok(addr);
        }
        let seg = &self.vm.segments[src];
        let (src_addr, seg_size, phys, flags) = (seg.addr, seg.size, seg.phys, seg.flags);

        let id = self.seg_place(map, None, seg_size, phys)?;
        let flags = if flags.contains(SegFlags::MAPPED) {
            (flags & SegFlags::PROT) | SegFlags::MAPPED
        } else {
            if let Err(err) = self.seg_share(src, id) {
                self.seg_free(map, id);
                return Err(err);
            }
            (flags & SegFlags::PROT) | SegFlags::SHARED
        };
        if let Err(err) = self.seg_back(map, id, phys, flags) {
            self.seg_discard(map, id);
            return Err(err);
        }
        let mapped = self.vm.segments[id].addr + (addr - src_addr);
        log::debug!("vm_map_task: {:?} {:#x} -> {:#x}", target, addr, mapped);
        Ok(mapped)
    }

    /// First allocated segment of `task` ending above `addr`
    ///
    /// Callers walk the address space by passing the end of the previous
    /// result.
    pub fn vm_info(&self, task: TaskId, addr: VirtAddr) -> KernResult<SegInfo> {
        let map = self.vm_task_map(task)?;
        let vm = &self.vm;
        vm.maps[map]
            .segs
            .iter(&vm.segments)
            .map(|id| &vm.segments[id])
            .find(|seg| !seg.is_free() && seg.end() > addr)
            .map(SegInfo::of)
            .ok_or(KernError::NotFound)
    }

    /// Physical address of a mapped, physically contiguous range
    pub fn vm_translate(&self, task: TaskId, addr: VirtAddr, size: usize) -> KernResult<PhysAddr> {
        let map = self.vm_task_map(task)?;
        if size == 0 {
            return Err(KernError::InvalidArgument);
        }
        match self.umem_chunks(map, addr, size, false)?[..] {
            [(pa, _)] => Ok(pa),
            _ => Err(KernError::Fault),
        }
    }

    /// Allocated segments of `task` in address order
    pub fn vm_regions(&self, task: TaskId) -> Vec<SegInfo> {
        let Some(t) = self.tasks.get(task) else {
            return Vec::new();
        };
        let vm = &self.vm;
        vm.maps[t.map]
            .segs
            .iter(&vm.segments)
            .map(|id| &vm.segments[id])
            .filter(|seg| !seg.is_free())
            .map(SegInfo::of)
            .collect()
    }

    /// Load a boot module image into `task`, returning its entry point
    ///
    /// The image pages are released once copied. Without an MMU the image
    /// is placed anywhere and the entry point relocated.
    pub(crate) fn vm_load(&mut self, task: TaskId, image: &ModuleImage) -> KernResult<VirtAddr> {
        let base = page_trunc(image.addr);
        let len = page_round(image.addr + image.size + image.bss) - base;
        let load = match self.vm.mode {
            VmMode::Paged => self.vm_allocate(task, base, len, false)?,
            VmMode::Flat => self.vm_allocate(task, 0, len, true)?,
        };
        let offset = image.addr - base;
        let map = self.tasks[task].map;
        let dst = match self.seg_lookup(map, load, len) {
            Some(id) => self.vm.segments[id].phys,
            None => panic!("vm_load: segment at {:#x} vanished", load),
        };
        self.vm.phys.copy(image.phys, dst + offset, image.size)?;
        self.page_free(page_trunc(image.phys), page_round(image.phys + image.size) - page_trunc(image.phys));

        let entry = image.entry - image.addr + load + offset;
        log::info!("loaded {} at {:#x}, entry {:#x}", image.name, load + offset, entry);
        Ok(entry)
    }

    // ========================================================================
    // Consistency
    // ========================================================================

    /// Panic unless `map`'s segment list partitions its user range
    pub(crate) fn vm_check_map(&self, map: MapId) {
        let vm = &self.vm;
        let m = &vm.maps[map];
        let mut expect = vm.user_min;
        let mut prev_free = false;
        let mut total = 0;
        for id in m.segs.iter(&vm.segments) {
            let seg = &vm.segments[id];
            assert_eq!(seg.map, map, "{:?} listed in foreign map", id);
            assert!(seg.size > 0, "{:?}: empty segment", id);
            assert_eq!(seg.addr, expect, "{:?}: gap or overlap at {:#x}", id, expect);
            assert!(!(prev_free && seg.is_free()), "{:?}: adjacent free segments", id);
            if seg.is_free() {
                assert!(seg.share.is_none(), "{:?}: free segment in share group", id);
            } else {
                total += seg.size;
            }
            assert_eq!(
                seg.flags.contains(SegFlags::SHARED),
                seg.share.is_some(),
                "{:?}: shared flag and group disagree",
                id
            );
            if let Some(group) = seg.share {
                let members = &vm.shares[group].members;
                assert!(members.len() >= 2, "{:?}: share group of one", group);
                assert!(members.contains(&id), "{:?} missing from {:?}", id, group);
            }
            prev_free = seg.is_free();
            expect = seg.end();
        }
        assert_eq!(expect, vm.user_max, "{:?}: segment list ends at {:#x}", map, expect);
        assert_eq!(total, m.total, "{:?}: allocation total out of sync", map);
    }

    /// Panic unless every share group is consistent
    pub(crate) fn vm_check_shares(&self) {
        let vm = &self.vm;
        for (group, share) in vm.shares.iter() {
            let first = &vm.segments[share.members[0]];
            for member in &share.members {
                let seg = vm.segments.get(*member).unwrap_or_else(|| panic!("{:?}: stale member", group));
                assert_eq!(seg.share, Some(group), "{:?}: member {:?} disowns group", group, member);
                assert!(vm.maps.contains(seg.map), "{:?}: member in dead map", group);
                assert_eq!((seg.phys, seg.size), (first.phys, first.size), "{:?}: members differ", group);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::task::VmOption;
    use crate::kern::testutil::*;
    use crate::kern::startup::KernelConfig;
    use proptest::prelude::*;

    fn check(k: &Kernel) {
        for (map, _) in k.vm.maps.iter() {
            k.vm_check_map(map);
        }
        k.vm_check_shares();
    }

    #[test]
    fn test_allocate_free_merges_holes() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let free = k.page_info().free;
        let a = k.vm_allocate(task, 0, 100, true).unwrap();
        let b = k.vm_allocate(task, 0, 3 * PAGE_SIZE, true).unwrap();
        let c = k.vm_allocate(task, 0x10_0000, PAGE_SIZE, false).unwrap();
        assert_eq!((a, b, c), (USER_MIN_ADDR, USER_MIN_ADDR + PAGE_SIZE, 0x10_0000));
        assert_eq!(k.vm_regions(task).len(), 3);
        check(&k);

        k.vm_free(task, b).unwrap();
        k.vm_free(task, a).unwrap();
        assert_eq!(k.vm_free(task, a), Err(KernError::InvalidArgument));
        k.vm_free(task, c).unwrap();
        check(&k);
        let map = k.tasks[task].map;
        assert_eq!(k.vm.maps[map].segs.len(), 1);
        // the page table for the first 4 MiB stays until the map goes
        assert_eq!(k.page_info().free + PAGE_SIZE, free);
    }

    const USER_MIN_ADDR: VirtAddr = crate::vm::USER_MIN;

    #[test]
    fn test_fixed_allocation_rejects_overlap_and_misalignment() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        k.vm_allocate(task, 0x20_0000, 2 * PAGE_SIZE, false).unwrap();
        assert_eq!(k.vm_allocate(task, 0x20_1000, PAGE_SIZE, false), Err(KernError::InvalidArgument));
        assert_eq!(k.vm_allocate(task, 0x30_0010, PAGE_SIZE, false), Err(KernError::InvalidArgument));
        assert_eq!(k.vm_allocate(task, 0x9000_0000, PAGE_SIZE, false), Err(KernError::InvalidArgument));
        assert_eq!(k.vm_allocate(task, 0, 0, true), Err(KernError::InvalidArgument));
        check(&k);
    }

    #[test]
    fn test_memory_is_zeroed_and_translated() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let addr = k.vm_allocate(task, 0, 2 * PAGE_SIZE, true).unwrap();
        k.copy_to_task(task, addr + 10, b"stale").unwrap();
        let pa = k.vm_translate(task, addr, 2 * PAGE_SIZE).unwrap();
        k.vm_free(task, addr).unwrap();

        let again = k.vm_allocate(task, 0, 2 * PAGE_SIZE, true).unwrap();
        assert_eq!(k.vm_translate(task, again, 1), Ok(pa));
        let mut buf = [0xffu8; 5];
        k.copy_from_task(task, again + 10, &mut buf).unwrap();
        assert_eq!(buf, [0; 5]);
        assert_eq!(k.vm_translate(task, again + 2 * PAGE_SIZE, 1), Err(KernError::Fault));
    }

    #[test]
    fn test_attribute_readonly_blocks_writes() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let addr = k.vm_allocate(task, 0, PAGE_SIZE, true).unwrap();
        k.vm_attribute(task, addr, SegFlags::READ).unwrap();
        assert_eq!(k.copy_to_task(task, addr, &[1]), Err(KernError::Fault));
        let mut buf = [0u8; 1];
        assert_eq!(k.copy_from_task(task, addr, &mut buf), Ok(()));
        assert_eq!(k.vm_attribute(task, addr, SegFlags::SHARED), Err(KernError::InvalidArgument));
        assert_eq!(k.vm_attribute(task, addr + PAGE_SIZE, SegFlags::READ), Err(KernError::InvalidArgument));
        assert_eq!(k.vm_info(task, 0).map(|i| i.flags), Ok(SegFlags::READ));
    }

    #[test]
    fn test_dup_copies_private_and_shares_readonly() {
        let mut k = boot_default();
        let parent = user_task(&mut k);
        let data = k.vm_allocate(parent, 0, PAGE_SIZE, true).unwrap();
        let text = k.vm_allocate(parent, 0, PAGE_SIZE, true).unwrap();
        k.copy_to_task(parent, data, b"parent").unwrap();
        k.copy_to_task(parent, text, b"code").unwrap();
        k.vm_attribute(parent, text, SegFlags::READ | SegFlags::EXEC).unwrap();

        let child = k.task_create(parent, VmOption::Copy).unwrap();
        check(&k);
        assert_ne!(k.vm_translate(child, data, 1), k.vm_translate(parent, data, 1));
        assert_eq!(k.vm_translate(child, text, 1), k.vm_translate(parent, text, 1));
        assert!(k.vm_info(child, text).unwrap().flags.contains(SegFlags::SHARED));

        k.copy_to_task(child, data, b"child!").unwrap();
        let mut buf = [0u8; 6];
        k.copy_from_task(parent, data, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");

        // write-enabling the shared text gives the child its own copy
        k.vm_attribute(child, text, SegFlags::READ | SegFlags::WRITE).unwrap();
        assert_ne!(k.vm_translate(child, text, 1), k.vm_translate(parent, text, 1));
        assert!(!k.vm_info(parent, text).unwrap().flags.contains(SegFlags::SHARED));
        let mut code = [0u8; 4];
        k.copy_from_task(child, text, &mut code).unwrap();
        assert_eq!(&code, b"code");
        check(&k);

        k.vm_free(child, data).unwrap();
        assert_eq!(k.vm_regions(parent).len(), 2);
        check(&k);
    }

    #[test]
    fn test_terminate_returns_every_page() {
        let mut k = boot_default();
        let free = k.page_info().free;
        let parent = user_task(&mut k);
        let text = k.vm_allocate(parent, 0, 4 * PAGE_SIZE, true).unwrap();
        k.vm_attribute(parent, text, SegFlags::READ).unwrap();
        k.vm_allocate(parent, 0x40_0000, PAGE_SIZE, false).unwrap();
        let child = k.task_create(parent, VmOption::Copy).unwrap();
        k.task_terminate(parent).unwrap();
        check(&k);
        k.task_terminate(child).unwrap();
        check(&k);
        assert!(k.vm.shares.is_empty());
        assert_eq!(k.page_info().free, free);
    }

    #[test]
    fn test_map_task_aliases_memory() {
        let mut k = boot_default();
        let server = user_task(&mut k);
        let client = user_task(&mut k);
        let buf = k.vm_allocate(client, 0, PAGE_SIZE, true).unwrap();
        k.copy_to_task(client, buf + 8, b"hello").unwrap();
        spawn(&mut k, server, 100);
        k.preempt_point();

        let alias = k.vm_map_task(client, buf + 8, 5).unwrap();
        let mut got = [0u8; 5];
        k.copyin(alias, &mut got).unwrap();
        assert_eq!(&got, b"hello");
        assert!(k.vm_info(server, 0).unwrap().flags.contains(SegFlags::SHARED));
        check(&k);

        k.task_setcap(server, Capabilities::empty()).unwrap();
        assert_eq!(k.vm_map_task(client, buf, 1), Err(KernError::PermissionDenied));
    }

    #[test]
    fn test_alias_keeps_pages_after_source_is_freed() {
        let mut k = boot_default();
        let server = user_task(&mut k);
        let client = user_task(&mut k);
        let bystander = user_task(&mut k);
        let buf = k.vm_allocate(client, 0, PAGE_SIZE, true).unwrap();
        k.copy_to_task(client, buf, b"client").unwrap();
        spawn(&mut k, server, 100);
        k.preempt_point();
        let alias = k.vm_map_task(client, buf, PAGE_SIZE).unwrap();
        let pages = k.vm_translate(server, alias, PAGE_SIZE).unwrap();

        k.vm_free(client, buf).unwrap();
        assert!(!k.vm.pages.is_free(pages, PAGE_SIZE));
        assert!(!k.vm_info(server, 0).unwrap().flags.contains(SegFlags::SHARED));
        check(&k);

        let other = k.vm_allocate(bystander, 0, PAGE_SIZE, true).unwrap();
        k.copy_to_task(bystander, other, b"secret").unwrap();
        assert_ne!(k.vm_translate(bystander, other, 1), Ok(pages));
        k.copyout(b"XXXXXX", alias).unwrap();
        let mut seen = [0u8; 6];
        k.copy_from_task(bystander, other, &mut seen).unwrap();
        assert_eq!(&seen, b"secret");
        k.copyin(alias, &mut seen).unwrap();
        assert_eq!(&seen, b"XXXXXX");

        // the last mapping returns the pages
        k.vm_free(server, alias).unwrap();
        assert!(k.vm.pages.is_free(pages, PAGE_SIZE));
        check(&k);
    }

    #[test]
    fn test_map_physical_needs_rawio() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        spawn(&mut k, task, 100);
        k.preempt_point();
        let va = k.vm_map(task, 0xfee0_0010, 16).unwrap();
        assert_eq!(va % PAGE_SIZE, 0x10);
        assert_eq!(k.vm_translate(task, va, 4), Ok(0xfee0_0010));
        // device memory outside RAM is not reachable by kernel copies
        assert_eq!(k.copyout(&[0], va), Err(KernError::Fault));
        assert_eq!(k.vm_attribute(task, va - 0x10, SegFlags::READ), Err(KernError::InvalidArgument));

        k.task_setcap(task, Capabilities::empty()).unwrap();
        assert_eq!(k.vm_map(task, 0xfee0_0000, 16), Err(KernError::PermissionDenied));
    }

    #[test]
    fn test_other_task_memory_needs_extmem() {
        let mut k = boot_default();
        let a = user_task(&mut k);
        let b = user_task(&mut k);
        spawn(&mut k, a, 100);
        k.preempt_point();
        assert!(k.vm_allocate(b, 0, PAGE_SIZE, true).is_ok());
        k.task_setcap(a, Capabilities::empty()).unwrap();
        assert_eq!(k.vm_allocate(b, 0, PAGE_SIZE, true), Err(KernError::PermissionDenied));
        assert!(k.vm_allocate(a, 0, PAGE_SIZE, true).is_ok());
    }

    #[test]
    fn test_flat_mode_identity_and_restrictions() {
        let mut k = boot_with(KernelConfig::default().with_vm_mode(VmMode::Flat));
        let task = user_task(&mut k);
        let addr = k.vm_allocate(task, 0, PAGE_SIZE, true).unwrap();
        assert_eq!(k.vm_translate(task, addr, PAGE_SIZE), Ok(addr));
        assert!(k.user_area(addr));
        assert_eq!(k.vm_allocate(task, addr + PAGE_SIZE, PAGE_SIZE, false), Err(KernError::InvalidArgument));
        assert_eq!(k.task_create(task, VmOption::Copy), Err(KernError::InvalidArgument));
        assert_eq!(k.vm_translate(task, addr + PAGE_SIZE, 1), Err(KernError::Fault));
        check(&k);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_segment_list_stays_partitioned(ops in proptest::collection::vec((0u8..4, 1usize..5, any::<u8>()), 1..40)) {
            let mut k = boot_default();
            let parent = user_task(&mut k);
            let mut child = None;
            let mut held: Vec<VirtAddr> = Vec::new();
            for (op, pages, pick) in ops {
                match op {
                    0 | 1 => {
                        if let Ok(addr) = k.vm_allocate(parent, 0, pages * PAGE_SIZE, true) {
                            held.push(addr);
                        }
                    }
                    2 if !held.is_empty() => {
                        let addr = held.swap_remove(pick as usize % held.len());
                        prop_assert_eq!(k.vm_free(parent, addr), Ok(()));
                    }
                    3 if child.is_none() => {
                        let before = k.vm_regions(parent);
                        let c = k.task_create(parent, VmOption::Copy).unwrap();
                        for region in k.vm_regions(c) {
                            prop_assert_eq!(k.vm_free(c, region.addr), Ok(()));
                        }
                        let after: Vec<(VirtAddr, usize)> = k.vm_regions(parent).iter().map(|r| (r.addr, r.size)).collect();
                        let expect: Vec<(VirtAddr, usize)> = before.iter().map(|r| (r.addr, r.size)).collect();
                        prop_assert_eq!(after, expect);
                        child = Some(c);
                    }
                    _ => {}
                }
                check(&k);
            }
        }
    }
}
