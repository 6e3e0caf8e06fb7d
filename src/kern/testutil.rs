//! Kernel fixtures for unit tests

use log::LevelFilter;

use crate::boot::{BootInfo, MemRange};
use crate::kern::cap::Capabilities;
use crate::kern::startup::KernelConfig;
use crate::kern::thread::ThreadKind;
use crate::kern::Kernel;
use crate::types::{TaskId, ThreadId};

/// 8 MiB of RAM at 1 MiB
pub const TEST_RAM: MemRange = MemRange::new(0x10_0000, 0x80_0000);

/// Default configuration, quiet logging
pub fn test_config() -> KernelConfig {
    KernelConfig::default().with_log_level(LevelFilter::Warn)
}

pub fn boot_with(config: KernelConfig) -> Kernel {
    let config = config.with_log_level(LevelFilter::Warn);
    Kernel::boot(config, &BootInfo::new(TEST_RAM), &[]).unwrap()
}

pub fn boot_default() -> Kernel {
    boot_with(KernelConfig::default())
}

/// An empty task with every capability, child of the kernel task
pub fn user_task(k: &mut Kernel) -> TaskId {
    let map = k.vm_create().unwrap();
    let kernel = k.kernel_task();
    k.task_alloc(Some(kernel), map, Capabilities::all(), "user").unwrap()
}

/// A runnable user thread in `task` at priority `pri`
///
/// It does not run before the next preemption point.
pub fn spawn(k: &mut Kernel, task: TaskId, pri: u8) -> ThreadId {
    let tid = k.thread_alloc(task, ThreadKind::User, pri).unwrap();
    k.threads[tid].suspend_count = 0;
    k.sched_setrun(tid);
    tid
}
