//! Deferred Procedure Calls
//!
//! Work that must run at thread level but is requested from a context that
//! cannot do it directly: interrupt handlers, or a thread releasing its own
//! resources. Requests queue in a fixed ring and run in order on the DPC
//! thread at `PRI_DPC`, above every ordinary thread.

use heapless::Deque;

use crate::kern::error::KernResult;
use crate::kern::event::{Pending, WaitResult};
use crate::kern::sched::PRI_DPC;
use crate::kern::thread::KernelBody;
use crate::kern::Kernel;
use crate::types::{EventId, ThreadId, ZoneId};

/// Queue depth
pub const NDPC: usize = 32;

/// Deferred function
pub type DpcFn = fn(&mut Kernel, usize);

#[derive(Debug)]
pub struct DpcState {
    queue: Deque<(DpcFn, usize), NDPC>,
    pub(crate) thread: ThreadId,
    pub(crate) event: EventId,
    /// Calls run since boot
    pub(crate) runs: u64,
}

impl DpcState {
    pub(crate) fn new() -> Self {
        Self {
            queue: Deque::new(),
            thread: ThreadId::null(),
            event: EventId::null(),
            runs: 0,
        }
    }
}

impl Kernel {
    pub(crate) fn dpc_init(&mut self) -> KernResult<()> {
        let ev = self.event_create("dpc")?;
        self.dpc.event = ev;
        self.dpc.thread = self.kthread_create(KernelBody::Dpc, PRI_DPC, ev)?;
        Ok(())
    }

    /// Queue `func(arg)` for the DPC thread
    ///
    /// A request identical to one already queued is dropped.
    pub(crate) fn dpc_schedule(&mut self, func: DpcFn, arg: usize) {
        let queued = self
            .dpc
            .queue
            .iter()
            .any(|(f, a)| *f as usize == func as usize && *a == arg);
        if queued {
            return;
        }
        if self.dpc.queue.push_back((func, arg)).is_err() {
            log::error!("dpc queue overflow ({} entries)", NDPC);
            panic!("dpc_schedule: queue full");
        }
        if !self.dpc.event.is_null() {
            self.sched_wakeup(self.dpc.event, WaitResult::Normal);
        }
    }

    /// DPC thread body
    pub(crate) fn dpc_thread(&mut self) {
        while let Some((func, arg)) = self.dpc.queue.pop_front() {
            self.dpc.runs += 1;
            func(self, arg);
        }
        self.sched_block(self.dpc.event, Pending::Kernel);
    }

    /// Requests waiting for the DPC thread
    pub fn dpc_pending(&self) -> usize {
        self.dpc.queue.len()
    }
}
