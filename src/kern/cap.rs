//! Task Capabilities
//!
//! Each task carries a fixed set of capability bits. Every privileged
//! operation checks the calling task's set before touching any state, so a
//! denied call has no partial effect.

use bitflags::bitflags;

use crate::kern::error::{KernError, KernResult};
use crate::kern::Kernel;
use crate::types::TaskId;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Capability bits of a task
    pub struct Capabilities: u32 {
        /// Raise scheduling priority, use FIFO policy
        const NICE = 1 << 0;
        /// Change capability sets
        const SETPCAP = 1 << 1;
        /// Control other tasks and their threads
        const TASKCTRL = 1 << 2;
        /// Access another task's memory
        const EXTMEM = 1 << 3;
        /// Create and destroy protected objects
        const PROTSERV = 1 << 4;
        /// Raw I/O: map physical memory, open protected devices
        const RAWIO = 1 << 5;
        /// Raise exceptions on other tasks
        const KILL = 1 << 6;
        /// Power control
        const POWERMGMT = 1 << 7;
        /// Set the system time
        const TIME = 1 << 8;
        /// Debug other tasks
        const DEBUG = 1 << 9;
        /// Kernel diagnostics (log output)
        const DIAG = 1 << 10;
        /// System administration
        const ADMIN = 1 << 11;
    }
}

impl Kernel {
    /// Task of the running thread
    pub(crate) fn cur_task(&self) -> TaskId {
        self.threads[self.sched.current].task
    }

    /// Does the calling task hold `cap`?
    pub(crate) fn cur_capable(&self, cap: Capabilities) -> bool {
        self.tasks[self.cur_task()].caps.contains(cap)
    }

    /// Fail with `PermissionDenied` unless the calling task holds `cap`
    pub(crate) fn check_cap(&self, cap: Capabilities) -> KernResult<()> {
        if self.cur_capable(cap) {
            return Ok(());
        }
        log::warn!("{:?}: missing capability {:?}", self.cur_task(), cap);
        Err(KernError::PermissionDenied)
    }

    /// The caller may control `task`: it is its own, or it holds TASKCTRL
    pub(crate) fn check_task_access(&self, task: TaskId) -> KernResult<()> {
        if task == self.cur_task() {
            return Ok(());
        }
        self.check_cap(Capabilities::TASKCTRL)
    }

    /// Does `task` hold `cap`?
    pub fn task_capable(&self, task: TaskId, cap: Capabilities) -> bool {
        self.tasks.get(task).is_some_and(|t| t.caps.contains(cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_twelve_independent_bits() {
        assert_eq!(Capabilities::all().bits().count_ones(), 12);
        assert_eq!(Capabilities::all().bits(), 0xfff);
    }

    #[test]
    fn test_contains_requires_every_bit() {
        let caps = Capabilities::NICE | Capabilities::KILL;
        assert!(caps.contains(Capabilities::KILL));
        assert!(!caps.contains(Capabilities::KILL | Capabilities::RAWIO));
    }
}
