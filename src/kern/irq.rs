//! Interrupt Dispatch
//!
//! Interrupt handling is split in two. The ISR runs at interrupt level as
//! soon as the vector fires; it must not block and only acknowledges the
//! device. When it needs more work it returns [`IsrResult::CallIst`] and the
//! vector's interrupt service thread (IST) is woken. The IST is an ordinary
//! kernel thread at a priority in the `PRI_IST` band derived from the
//! interrupt priority level, so it preempts user work but never an ISR.
//!
//! Rescheduling requested by an ISR is deferred to the outermost interrupt
//! exit.

use alloc::vec::Vec;

use crate::kern::error::{KernError, KernResult};
use crate::kern::event::{Pending, WaitResult};
use crate::kern::sched::PRI_IST;
use crate::kern::thread::KernelBody;
use crate::kern::Kernel;
use crate::types::{EventId, ThreadId};

// ============================================================================
// Interrupt Priority Levels
// ============================================================================

pub const IPL_NONE: u32 = 0;
pub const IPL_COMM: u32 = 1;
pub const IPL_NET: u32 = 3;
pub const IPL_DISK: u32 = 4;
pub const IPL_INPUT: u32 = 6;
pub const IPL_CLOCK: u32 = 11;
pub const IPL_HIGH: u32 = 15;

/// What the kernel should do after an ISR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsrResult {
    /// Interrupt fully handled
    Done,
    /// The device reported an error
    Error,
    /// Wake the interrupt service thread
    CallIst,
}

/// Interrupt service routine
pub type Isr = fn(&mut Kernel, usize) -> IsrResult;
/// Interrupt service thread body
pub type Ist = fn(&mut Kernel, usize);

#[derive(Debug)]
struct Irq {
    ipl: u32,
    isr: Isr,
    ist: Option<Ist>,
    arg: usize,
    /// Interrupts taken
    count: u64,
    /// IST runs requested and not yet done
    ist_request: u32,
    ist_thread: Option<ThreadId>,
    ist_event: Option<EventId>,
}

/// Per-vector statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqStats {
    pub ipl: u32,
    pub count: u64,
    pub ist_pending: u32,
}

#[derive(Debug)]
pub struct IrqState {
    table: Vec<Option<Irq>>,
    /// Interrupt nesting depth
    pub(crate) nesting: u32,
    /// Interrupts on vectors with no handler
    pub(crate) spurious: u64,
}

impl IrqState {
    pub(crate) fn new(nirqs: usize) -> Self {
        let mut table = Vec::with_capacity(nirqs);
        table.resize_with(nirqs, || None);
        Self {
            table,
            nesting: 0,
            spurious: 0,
        }
    }
}

impl Kernel {
    /// Attach an ISR (and optionally an IST) to a vector
    pub fn irq_attach(
        &mut self,
        vector: usize,
        ipl: u32,
        isr: Isr,
        ist: Option<Ist>,
        arg: usize,
    ) -> KernResult<()> {
        if vector >= self.irq.table.len() || ipl == IPL_NONE || ipl > IPL_HIGH {
            return Err(KernError::InvalidArgument);
        }
        if self.irq.table[vector].is_some() {
            return Err(KernError::Busy);
        }

        let (ist_thread, ist_event) = if ist.is_some() {
            let ev = self.event_create("ist")?;
            let pri = PRI_IST + (IPL_HIGH - ipl) as u8;
            match self.kthread_create(KernelBody::Ist(vector), pri, ev) {
                Ok(tid) => (Some(tid), Some(ev)),
                Err(err) => {
                    self.event_destroy(ev);
                    return Err(err);
                }
            }
        } else {
            (None, None)
        };

        self.irq.table[vector] = Some(Irq {
            ipl,
            isr,
            ist,
            arg,
            count: 0,
            ist_request: 0,
            ist_thread,
            ist_event,
        });
        log::debug!("irq_attach: vector {} ipl {}", vector, ipl);
        Ok(())
    }

    /// Detach a vector, stopping its IST
    pub fn irq_detach(&mut self, vector: usize) -> KernResult<()> {
        let irq = self
            .irq
            .table
            .get_mut(vector)
            .and_then(Option::take)
            .ok_or(KernError::InvalidArgument)?;
        if let Some(tid) = irq.ist_thread {
            self.thread_destroy(tid);
        }
        if let Some(ev) = irq.ist_event {
            self.event_destroy(ev);
        }
        log::debug!("irq_detach: vector {}", vector);
        Ok(())
    }

    /// Interrupt entry for `vector`
    pub fn interrupt(&mut self, vector: usize) {
        self.irq.nesting += 1;

        let handler = match self.irq.table.get_mut(vector) {
            Some(Some(irq)) => {
                irq.count += 1;
                Some((irq.isr, irq.arg))
            }
            _ => None,
        };
        match handler {
            None => {
                self.irq.spurious += 1;
                log::warn!("spurious interrupt on vector {}", vector);
            }
            Some((isr, arg)) => match isr(self, arg) {
                IsrResult::Done => {}
                IsrResult::Error => log::warn!("irq {}: device error", vector),
                IsrResult::CallIst => self.ist_request(vector),
            },
        }

        self.irq.nesting -= 1;
        if self.irq.nesting == 0 {
            self.preempt_point();
        }
    }

    fn ist_request(&mut self, vector: usize) {
        let ev = match self.irq.table.get_mut(vector) {
            Some(Some(irq)) if irq.ist_event.is_some() => {
                irq.ist_request += 1;
                irq.ist_event
            }
            _ => {
                log::error!("irq {}: IST requested but none attached", vector);
                None
            }
        };
        if let Some(ev) = ev {
            self.sched_wakeup(ev, WaitResult::Normal);
        }
    }

    /// Interrupt service thread body
    pub(crate) fn ist_thread(&mut self, vector: usize) {
        loop {
            let work = match self.irq.table.get_mut(vector) {
                Some(Some(irq)) if irq.ist_request > 0 => {
                    irq.ist_request -= 1;
                    irq.ist.map(|ist| (ist, irq.arg))
                }
                _ => None,
            };
            match work {
                Some((ist, arg)) => ist(self, arg),
                None => break,
            }
        }
        let ev = match self.irq.table.get(vector) {
            Some(Some(Irq { ist_event: Some(ev), .. })) => *ev,
            _ => panic!("ist_thread: vector {} has no IST event", vector),
        };
        self.sched_block(ev, Pending::Kernel);
    }

    /// Statistics for a vector
    pub fn irq_stats(&self, vector: usize) -> Option<IrqStats> {
        match self.irq.table.get(vector) {
            Some(Some(irq)) => Some(IrqStats {
                ipl: irq.ipl,
                count: irq.count,
                ist_pending: irq.ist_request,
            }),
            _ => None,
        }
    }

    /// Interrupts taken on unattached vectors
    pub fn irq_spurious(&self) -> u64 {
        self.irq.spurious
    }

    /// Current interrupt nesting depth
    pub fn irq_level(&self) -> u32 {
        self.irq.nesting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil::*;
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn isr_done(_k: &mut Kernel, _arg: usize) -> IsrResult {
        IsrResult::Done
    }

    #[test]
    fn test_attach_checks() {
        let mut k = boot_default();
        assert_eq!(k.irq_attach(1000, IPL_DISK, isr_done, None, 0), Err(KernError::InvalidArgument));
        assert_eq!(k.irq_attach(3, IPL_NONE, isr_done, None, 0), Err(KernError::InvalidArgument));
        assert_eq!(k.irq_attach(3, IPL_DISK, isr_done, None, 0), Ok(()));
        assert_eq!(k.irq_attach(3, IPL_DISK, isr_done, None, 0), Err(KernError::Busy));
        let clock = k.config.clock_irq;
        assert_eq!(k.irq_attach(clock, IPL_DISK, isr_done, None, 0), Err(KernError::Busy));
    }

    #[test]
    fn test_spurious_and_counts() {
        let mut k = boot_default();
        k.irq_attach(3, IPL_DISK, isr_done, None, 0).unwrap();
        k.interrupt(3);
        k.interrupt(3);
        k.interrupt(4);
        assert_eq!(k.irq_stats(3).map(|s| s.count), Some(2));
        assert_eq!(k.irq_spurious(), 1);
        k.irq_detach(3).unwrap();
        k.interrupt(3);
        assert_eq!(k.irq_spurious(), 2);
        assert_eq!(k.irq_detach(3), Err(KernError::InvalidArgument));
    }

    static IST_RUNS: AtomicUsize = AtomicUsize::new(0);
    static IST_SAW_LEVEL: AtomicU32 = AtomicU32::new(99);

    fn isr_defer(_k: &mut Kernel, _arg: usize) -> IsrResult {
        IsrResult::CallIst
    }

    fn ist_count(k: &mut Kernel, arg: usize) {
        assert_eq!(arg, 0x55);
        IST_SAW_LEVEL.store(k.irq_level(), Ordering::SeqCst);
        IST_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_ist_runs_after_isr_at_thread_level() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let user = spawn(&mut k, task, 100);
        k.preempt_point();
        k.irq_attach(5, IPL_NET, isr_defer, Some(ist_count), 0x55).unwrap();

        k.interrupt(5);
        assert_eq!(IST_RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(IST_SAW_LEVEL.load(Ordering::SeqCst), 0);
        assert_eq!(k.current(), user);
        assert_eq!(k.irq_stats(5).map(|s| s.ist_pending), Some(0));

        k.irq_detach(5).unwrap();
        k.preempt_point();
        k.check_invariants();
    }

    static OUTER_SWITCHED: AtomicUsize = AtomicUsize::new(0);

    fn ist_nop(_k: &mut Kernel, _arg: usize) {}

    fn isr_nested(k: &mut Kernel, _arg: usize) -> IsrResult {
        let before = k.current();
        k.interrupt(6);
        if k.current() != before {
            OUTER_SWITCHED.fetch_add(1, Ordering::SeqCst);
        }
        IsrResult::Done
    }

    #[test]
    fn test_nested_interrupt_defers_preemption() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let user = spawn(&mut k, task, 100);
        k.preempt_point();
        k.irq_attach(6, IPL_DISK, isr_defer, Some(ist_nop), 0).unwrap();
        k.irq_attach(7, IPL_CLOCK, isr_nested, None, 0).unwrap();
        k.interrupt(7);
        assert_eq!(OUTER_SWITCHED.load(Ordering::SeqCst), 0);
        assert_eq!(k.current(), user);
        assert_eq!(k.irq_stats(6).map(|s| s.count), Some(1));
        assert_eq!(k.irq_stats(6).map(|s| s.ist_pending), Some(0));
    }
}
