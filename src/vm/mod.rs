//! Virtual Memory Manager
//!
//! Each task has one VM map: an address-sorted list of segments that
//! exactly partitions the user address range. Allocated segments are
//! backed by contiguous physical pages from the page allocator; free
//! segments are holes. Maps are reference counted so tasks created with
//! [`VmOption::Share`](crate::kern::task::VmOption) can use the same map.
//!
//! Two configurations are supported:
//!
//! - `Paged`: every map has its own page directory and the user range is
//!   `[USER_MIN, USER_MAX)`.
//! - `Flat`: no MMU. Addresses are physical, the user range is RAM, and
//!   protection reduces to the segment bounds check.
//!
//! Segments duplicated into a child map without copying (read-only or
//! explicitly shared ones) form a share group. A write-enable on a shared
//! segment gives the caller a private copy first.

pub mod map;
pub mod page;
pub mod phys;
pub mod pmap;
pub mod umem;

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::kern::queue::{QueueChain, QueueHead, Queued};
use crate::kern::zalloc::Zone;
use crate::types::{MapId, PhysAddr, SegmentId, ShareId, VirtAddr};

pub use map::SegInfo;
pub use page::{PageAlloc, PageInfo};
pub use phys::PhysMem;

// ============================================================================
// Constants
// ============================================================================

/// Page size
pub const PAGE_SIZE: usize = 4096;

/// Lowest user address with an MMU (page 0 stays unmapped)
pub const USER_MIN: VirtAddr = 0x1000;

/// End of the user address range with an MMU
pub const USER_MAX: VirtAddr = 0x8000_0000;

pub const fn page_round(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub const fn page_trunc(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Memory management configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmMode {
    /// Page tables, per-task address spaces
    #[default]
    Paged,
    /// No MMU, identity mapped
    Flat,
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Segment attributes
    pub struct SegFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Backing pages shared with segments of other maps
        const SHARED = 1 << 4;
        /// Alias of memory the map does not own
        const MAPPED = 1 << 5;
        /// Unallocated hole
        const FREE = 1 << 7;
    }
}

impl SegFlags {
    /// Attribute bits a caller may set
    pub const PROT: Self = Self::READ.union(Self::WRITE).union(Self::EXEC);
}

// ============================================================================
// Segment / Map
// ============================================================================

#[derive(Debug)]
pub struct Segment {
    pub(crate) map: MapId,
    pub(crate) addr: VirtAddr,
    pub(crate) size: usize,
    pub(crate) phys: PhysAddr,
    pub(crate) flags: SegFlags,
    pub(crate) share: Option<ShareId>,
    pub(crate) link: QueueChain<SegmentId>,
}

impl Segment {
    pub(crate) fn end(&self) -> VirtAddr {
        self.addr + self.size
    }

    pub(crate) fn is_free(&self) -> bool {
        self.flags.contains(SegFlags::FREE)
    }
}

impl Queued<SegmentId> for Segment {
    fn chain(&self) -> &QueueChain<SegmentId> {
        &self.link
    }

    fn chain_mut(&mut self) -> &mut QueueChain<SegmentId> {
        &mut self.link
    }
}

#[derive(Debug)]
pub struct VmMap {
    /// Segments in address order
    pub(crate) segs: QueueHead<SegmentId>,
    /// Page directory (paged mode)
    pub(crate) pgd: Option<PhysAddr>,
    pub(crate) refcnt: u32,
    /// Bytes allocated
    pub(crate) total: usize,
}

/// Segments of different maps backed by the same pages
#[derive(Debug)]
pub struct ShareGroup {
    pub(crate) members: Vec<SegmentId>,
}

// ============================================================================
// VM State
// ============================================================================

#[derive(Debug)]
pub struct VmState {
    pub(crate) mode: VmMode,
    pub(crate) phys: PhysMem,
    pub(crate) pages: PageAlloc,
    pub(crate) maps: Zone<MapId, VmMap>,
    pub(crate) segments: Zone<SegmentId, Segment>,
    pub(crate) shares: Zone<ShareId, ShareGroup>,
    /// Map loaded in the MMU
    pub(crate) active: Option<MapId>,
    /// Address space switches
    pub(crate) switches: u64,
    pub(crate) user_min: VirtAddr,
    pub(crate) user_max: VirtAddr,
}

impl VmState {
    pub(crate) fn new(mode: VmMode, ram_base: PhysAddr, ram_size: usize, map_limit: usize, seg_limit: usize) -> Self {
        let (user_min, user_max) = match mode {
            VmMode::Paged => (USER_MIN, USER_MAX),
            VmMode::Flat => (page_round(ram_base), page_trunc(ram_base + ram_size)),
        };
        Self {
            mode,
            phys: PhysMem::new(ram_base, ram_size),
            pages: PageAlloc::new(ram_base, ram_size),
            maps: Zone::new("vm_map", map_limit),
            segments: Zone::new("segment", seg_limit),
            shares: Zone::new("share", seg_limit),
            active: None,
            switches: 0,
            user_min,
            user_max,
        }
    }

    pub fn mode(&self) -> VmMode {
        self.mode
    }
}
