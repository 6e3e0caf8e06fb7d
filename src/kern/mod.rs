//! Kern subsystem - Core kernel
//!
//! All kernel state lives in one [`Kernel`] value. Every kernel service is
//! a method on it and runs with exclusive access (`&mut Kernel`), which
//! stands in for the scheduler lock and interrupt masking of a
//! uniprocessor kernel. Entities refer to each other through
//! generation-checked handles into per-type zones, never through pointers.
//!
//! A call that has to wait returns [`Completion::Blocked`] after queueing
//! the caller on an event; the result is stored in the thread's context
//! when it is woken and can be read back with
//! [`Kernel::thread_result`].

pub mod cap;
pub mod dpc;
pub mod error;
pub mod event;
pub mod exception;
pub mod host;
pub mod invariants;
pub mod irq;
pub mod queue;
pub mod sched;
pub mod startup;
pub mod syscall_sw;
pub mod task;
pub mod thread;
pub mod timer;
pub mod zalloc;

#[cfg(test)]
pub(crate) mod testutil;

use alloc::vec::Vec;

use crate::drivers::DevState;
use crate::ipc::IpcState;
use crate::types::{EventId, TaskId, ThreadId};
use crate::vm::VmState;

pub use cap::Capabilities;
pub use error::{KernError, KernResult};
pub use event::{Completion, WaitResult};
pub use sched::{SchedPolicy, SchedStats, ThreadState};
pub use startup::{kernel_init, KernelConfig, KERNEL};
pub use task::VmOption;
pub use thread::{Context, SchedParam};
pub use zalloc::Zone;

use dpc::DpcState;
use event::Event;
use irq::IrqState;
use sched::SchedState;
use task::Task;
use thread::Thread;
use timer::TimerState;

/// The kernel
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) events: Zone<EventId, Event>,
    pub(crate) tasks: Zone<TaskId, Task>,
    pub(crate) threads: Zone<ThreadId, Thread>,
    pub(crate) sched: SchedState,
    pub(crate) timer: TimerState,
    pub(crate) irq: IrqState,
    pub(crate) dpc: DpcState,
    pub(crate) vm: VmState,
    pub(crate) ipc: IpcState,
    pub(crate) dev: DevState,
    /// Owner of the kernel threads
    pub(crate) kernel_task: TaskId,
    pub(crate) boot_tasks: Vec<TaskId>,
}

static_assertions::assert_impl_all!(Kernel: Send);
