//! Host Information
//!
//! System-wide queries: kernel identity and configuration, memory usage,
//! the clock, entity counts and the device table, plus the diagnostic
//! log call.

use alloc::vec;
use alloc::vec::Vec;

use crate::kern::cap::Capabilities;
use crate::kern::error::KernResult;
use crate::kern::Kernel;
use crate::vm::VmMode;

/// Longest string accepted by `sys_log`
pub const LOG_MAX: usize = 128;

// ============================================================================
// Info Flavors
// ============================================================================

/// What `sys_info` reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InfoFlavor {
    Kernel = 1,
    Memory = 2,
    Timer = 3,
    Thread = 4,
    Device = 5,
}

impl InfoFlavor {
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            1 => Some(Self::Kernel),
            2 => Some(Self::Memory),
            3 => Some(Self::Timer),
            4 => Some(Self::Thread),
            5 => Some(Self::Device),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub hz: u32,
    pub time_slice_ms: u32,
    pub vm_mode: VmMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Bytes of RAM managed by the page allocator
    pub total: usize,
    pub free: usize,
    /// Bytes held by kernel threads' stacks
    pub kernel: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerInfo {
    pub hz: u32,
    pub ticks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tasks: usize,
    pub threads: usize,
    pub objects: usize,
    pub switches: u64,
}

/// Answer to a `sys_info` query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysInfo {
    Kernel(KernelInfo),
    Memory(MemoryInfo),
    Timer(TimerInfo),
    Thread(ThreadInfo),
    /// Registered devices
    Device(usize),
}

impl SysInfo {
    /// Word layout copied out to user space
    pub fn to_words(&self) -> Vec<usize> {
        match *self {
            Self::Kernel(k) => vec![k.hz as usize, k.time_slice_ms as usize, k.vm_mode as usize],
            Self::Memory(m) => vec![m.total, m.free, m.kernel],
            Self::Timer(t) => vec![t.hz as usize, t.ticks as usize],
            Self::Thread(t) => vec![t.tasks, t.threads, t.objects, t.switches as usize],
            Self::Device(n) => vec![n],
        }
    }
}

// ============================================================================
// Calls
// ============================================================================

impl Kernel {
    pub fn sys_info(&self, flavor: InfoFlavor) -> SysInfo {
        match flavor {
            InfoFlavor::Kernel => SysInfo::Kernel(KernelInfo {
                name: crate::NAME,
                version: crate::VERSION,
                hz: self.config.hz,
                time_slice_ms: self.config.time_slice_ms,
                vm_mode: self.vm.mode,
            }),
            InfoFlavor::Memory => {
                let pages = self.page_info();
                let kernel = self
                    .tasks
                    .get(self.kernel_task)
                    .map_or(0, |t| t.threads.len() * crate::kern::thread::KSTACK_SIZE);
                SysInfo::Memory(MemoryInfo {
                    total: pages.total,
                    free: pages.free,
                    kernel,
                })
            }
            InfoFlavor::Timer => SysInfo::Timer(TimerInfo {
                hz: self.config.hz,
                ticks: self.timer_ticks(),
            }),
            InfoFlavor::Thread => SysInfo::Thread(ThreadInfo {
                tasks: self.tasks.len(),
                threads: self.threads.len(),
                objects: self.ipc.objects.len(),
                switches: self.sched.stats.switches,
            }),
            InfoFlavor::Device => SysInfo::Device(self.dev.devices.len()),
        }
    }

    /// Clock ticks since boot
    pub fn sys_time(&self) -> u32 {
        self.timer_ticks()
    }

    /// Append user text to the console
    pub fn sys_log(&mut self, msg: &str) -> KernResult<()> {
        self.check_cap(Capabilities::DIAG)?;
        crate::print!("{}", msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::error::KernError;
    use crate::kern::testutil::*;

    #[test]
    fn test_info_counts() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        spawn(&mut k, task, 100);
        k.preempt_point();
        k.object_create("info").unwrap();

        let SysInfo::Thread(t) = k.sys_info(InfoFlavor::Thread) else {
            panic!("wrong flavor");
        };
        assert_eq!((t.tasks, t.objects), (2, 1));
        assert!(t.switches >= 1);

        let SysInfo::Memory(m) = k.sys_info(InfoFlavor::Memory) else {
            panic!("wrong flavor");
        };
        assert_eq!(m.total, TEST_RAM.size);
        assert!(m.free < m.total && m.kernel > 0);
    }

    #[test]
    fn test_time_and_kernel_info() {
        let mut k = boot_default();
        k.clock_tick();
        k.clock_tick();
        assert_eq!(k.sys_time(), 2);
        assert_eq!(k.sys_info(InfoFlavor::Timer).to_words(), vec![100, 2]);
        let SysInfo::Kernel(info) = k.sys_info(InfoFlavor::Kernel) else {
            panic!("wrong flavor");
        };
        assert_eq!(info.name, "kestrel");
        assert_eq!(InfoFlavor::from_u32(9), None);
    }

    #[test]
    fn test_log_needs_diag() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        spawn(&mut k, task, 100);
        k.preempt_point();
        k.sys_log("sys-log-line\n").unwrap();
        assert!(crate::console::msgbuf().contains("sys-log-line"));
        k.task_setcap(task, Capabilities::empty()).unwrap();
        assert_eq!(k.sys_log("denied\n"), Err(KernError::PermissionDenied));
    }
}
