//! Boot information
//!
//! The boot loader leaves the RAM layout and the images of the bootstrap
//! modules in a [`BootInfo`] block. The kernel reads it once during
//! [`Kernel::boot`](crate::kern::Kernel::boot): reserved ranges and module
//! images are withheld from the page allocator, and the first `nr_tasks`
//! modules become the initial user tasks.

use core::fmt;

use heapless::{String, Vec};

use crate::kern::error::{KernError, KernResult};
use crate::types::{PhysAddr, VirtAddr};

/// Maximum reserved ranges
pub const MAX_RESERVED: usize = 8;
/// Maximum boot modules
pub const MAX_MODULES: usize = 8;
/// Module name buffer size
pub const MODULE_NAME: usize = 16;

/// A physical memory range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRange {
    pub base: PhysAddr,
    pub size: usize,
}

impl MemRange {
    pub const fn new(base: PhysAddr, size: usize) -> Self {
        Self { base, size }
    }

    pub fn end(&self) -> PhysAddr {
        self.base + self.size
    }

    pub fn contains(&self, other: &MemRange) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }
}

/// A program image placed in RAM by the boot loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    pub name: String<MODULE_NAME>,
    /// Where the image bytes are
    pub phys: PhysAddr,
    /// Image size (text and data)
    pub size: usize,
    /// Link address of the image
    pub addr: VirtAddr,
    /// Entry point, a link address
    pub entry: VirtAddr,
    /// Zero-filled bytes following the image
    pub bss: usize,
}

impl ModuleImage {
    pub fn new(name: &str, phys: PhysAddr, size: usize, addr: VirtAddr, entry: VirtAddr) -> KernResult<Self> {
        let mut s = String::new();
        s.push_str(name).map_err(|_| KernError::InvalidArgument)?;
        Ok(Self {
            name: s,
            phys,
            size,
            addr,
            entry,
            bss: 0,
        })
    }

    pub fn with_bss(mut self, bss: usize) -> Self {
        self.bss = bss;
        self
    }

    /// Physical range holding the image
    pub fn range(&self) -> MemRange {
        MemRange::new(self.phys, self.size)
    }
}

impl fmt::Display for ModuleImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes at {:#x})", self.name, self.size, self.phys)
    }
}

/// Boot information block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootInfo {
    pub ram: MemRange,
    /// Ranges the kernel must not hand out
    pub reserved: Vec<MemRange, MAX_RESERVED>,
    pub modules: Vec<ModuleImage, MAX_MODULES>,
    /// Leading modules started as tasks
    pub nr_tasks: usize,
}

impl BootInfo {
    pub fn new(ram: MemRange) -> Self {
        Self {
            ram,
            reserved: Vec::new(),
            modules: Vec::new(),
            nr_tasks: 0,
        }
    }

    pub fn with_reserved(mut self, range: MemRange) -> KernResult<Self> {
        self.reserved.push(range).map_err(|_| KernError::ResourceExhausted)?;
        Ok(self)
    }

    /// Add a module that is started as a task
    pub fn with_task(mut self, image: ModuleImage) -> KernResult<Self> {
        self.modules.push(image).map_err(|_| KernError::ResourceExhausted)?;
        self.nr_tasks += 1;
        Ok(self)
    }

    /// Check the block against itself
    pub fn validate(&self) -> KernResult<()> {
        if self.ram.size == 0 || self.nr_tasks > self.modules.len() {
            return Err(KernError::InvalidArgument);
        }
        for range in &self.reserved {
            if !self.ram.contains(range) {
                log::warn!("boot: reserved {:x?} outside RAM", range);
                return Err(KernError::InvalidArgument);
            }
        }
        for image in &self.modules {
            if !self.ram.contains(&image.range()) || image.entry < image.addr {
                log::warn!("boot: bad module {}", image);
                return Err(KernError::InvalidArgument);
            }
        }
        Ok(())
    }
}
