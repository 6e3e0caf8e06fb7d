//! Exception Handling
//!
//! Each task has a 32-bit set of pending exceptions and at most one user
//! handler entry. Posting an exception either hands it straight to a
//! thread waiting in `exception_wait`, or records it and interrupts one
//! interruptibly blocked thread of the task so the task notices it.
//!
//! Recorded exceptions are delivered synchronously when a thread of the
//! task returns to user mode: its context is saved and it resumes at the
//! handler with the exception number as argument. `exception_return`
//! restores the saved context.
//!
//! Posting never blocks and is safe from interrupt context.

use crate::kern::cap::Capabilities;
use crate::kern::error::{KernError, KernResult};
use crate::kern::event::{Completion, Pending, WaitResult};
use crate::kern::sched::ThreadState;
use crate::kern::thread::ThreadKind;
use crate::kern::Kernel;
use crate::types::{TaskId, VirtAddr};

/// Illegal instruction
pub const EXC_ILL: u32 = 4;
/// Breakpoint or trace trap
pub const EXC_TRAP: u32 = 5;
/// Floating point error
pub const EXC_FPE: u32 = 8;
/// Segmentation violation
pub const EXC_SEGV: u32 = 11;
/// Alarm clock
pub const EXC_ALRM: u32 = 14;
/// Number of exception codes
pub const NEXC: u32 = 32;

impl Kernel {
    /// Install (or with `None` remove) the calling task's handler
    ///
    /// Removing the handler discards pending exceptions.
    pub fn exception_setup(&mut self, handler: Option<VirtAddr>) -> KernResult<()> {
        if let Some(addr) = handler {
            if !self.user_area(addr) {
                return Err(KernError::Fault);
            }
        }
        let task = self.cur_task();
        let t = &mut self.tasks[task];
        t.handler = handler;
        if handler.is_none() {
            t.exc_pending = 0;
        }
        log::debug!("exception_setup: {:?} handler {:x?}", task, handler);
        Ok(())
    }

    /// Raise an exception on a task
    pub fn exception_raise(&mut self, task: TaskId, exc: u32) -> KernResult<()> {
        if exc >= NEXC {
            return Err(KernError::InvalidArgument);
        }
        let t = self.tasks.get(task).ok_or(KernError::InvalidArgument)?;
        if !t.active {
            return Err(KernError::InvalidState);
        }
        if task == self.kernel_task {
            return Err(KernError::PermissionDenied);
        }
        if task != self.cur_task() {
            self.check_cap(Capabilities::KILL)?;
        }
        if self.tasks[task].handler.is_none() {
            return Err(KernError::InvalidState);
        }
        self.exception_post(task, exc);
        Ok(())
    }

    /// Post an exception to a task (kernel and interrupt context)
    pub(crate) fn exception_post(&mut self, task: TaskId, exc: u32) {
        let (exc_event, threads) = match self.tasks.get(task) {
            Some(t) if t.active && t.handler.is_some() => (t.exc_event, t.threads.clone()),
            _ => {
                log::debug!("exception {} to {:?} dropped", exc, task);
                return;
            }
        };

        if let Some(waiter) = self.event_first(exc_event) {
            self.threads[waiter].wake_value = exc as usize;
            self.sched_unsleep(waiter, WaitResult::Normal);
            return;
        }

        self.tasks[task].exc_pending |= 1 << exc;
        let blocked = threads.into_iter().find(|tid| {
            let thread = &self.threads[*tid];
            thread.state == ThreadState::Blocked && thread.pending.is_some_and(|p| p.interruptible())
        });
        if let Some(tid) = blocked {
            self.sched_unsleep(tid, WaitResult::Interrupted);
        }
    }

    /// Wait for an exception to be posted to the calling task
    pub fn exception_wait(&mut self) -> KernResult<Completion<u32>> {
        let task = self.cur_task();
        let t = &mut self.tasks[task];
        if t.handler.is_none() {
            return Err(KernError::InvalidState);
        }
        if t.exc_pending != 0 {
            let exc = t.exc_pending.trailing_zeros();
            t.exc_pending &= !(1 << exc);
            return Ok(Completion::Done(exc));
        }
        let ev = t.exc_event;
        Ok(self.sched_sleep(ev, Pending::ExceptionWait))
    }

    /// Leave an exception handler, restoring the interrupted context
    pub fn exception_return(&mut self) -> KernResult<()> {
        let cur = self.sched.current;
        let thread = &mut self.threads[cur];
        let saved = thread.saved_ctx.take().ok_or(KernError::InvalidState)?;
        thread.ctx = saved;
        Ok(())
    }

    /// Deliver a pending exception to the current thread on its way to user mode
    pub(crate) fn exception_deliver(&mut self) {
        let cur = self.sched.current;
        let thread = &self.threads[cur];
        if thread.kind != ThreadKind::User
            || thread.state != ThreadState::Running
            || thread.saved_ctx.is_some()
        {
            return;
        }
        let t = &mut self.tasks[thread.task];
        let handler = match t.handler {
            Some(handler) if t.exc_pending != 0 => handler,
            _ => return,
        };
        let exc = t.exc_pending.trailing_zeros();
        t.exc_pending &= !(1 << exc);

        let thread = &mut self.threads[cur];
        thread.saved_ctx = Some(thread.ctx);
        thread.ctx.pc = handler;
        thread.ctx.arg = exc as usize;
        log::debug!("exception {} delivered to {:?}", exc, cur);
    }

    /// Report a processor fault taken by the current thread
    ///
    /// A task without a handler cannot recover and is terminated.
    pub fn exception_mark(&mut self, exc: u32) -> KernResult<()> {
        if exc >= NEXC {
            return Err(KernError::InvalidArgument);
        }
        let task = self.cur_task();
        if task == self.kernel_task {
            log::error!("exception {} in kernel thread {:?}", exc, self.sched.current);
            panic!("exception {} in kernel context", exc);
        }
        if self.tasks[task].handler.is_none() {
            log::warn!("{:?}: unhandled exception {}, terminating", task, exc);
            return self.task_terminate(task);
        }
        self.exception_post(task, exc);
        Ok(())
    }

    /// Pending exception bits of a task
    pub fn exception_pending(&self, task: TaskId) -> u32 {
        self.tasks.get(task).map_or(0, |t| t.exc_pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil::*;

    const HANDLER: VirtAddr = 0x4000;

    #[test]
    fn test_raise_delivers_to_handler() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let tid = spawn(&mut k, task, 100);
        k.preempt_point();
        k.threads[tid].ctx.pc = 0x1234;
        k.exception_setup(Some(HANDLER)).unwrap();
        k.exception_raise(task, EXC_TRAP).unwrap();
        assert_eq!(k.exception_pending(task), 1 << EXC_TRAP);

        k.preempt_point();
        let ctx = k.thread_context(tid).unwrap();
        assert_eq!((ctx.pc, ctx.arg), (HANDLER, EXC_TRAP as usize));
        assert_eq!(k.exception_pending(task), 0);

        k.exception_return().unwrap();
        assert_eq!(k.thread_context(tid).unwrap().pc, 0x1234);
        assert_eq!(k.exception_return(), Err(KernError::InvalidState));
    }

    #[test]
    fn test_raise_checks() {
        let mut k = boot_default();
        let a = user_task(&mut k);
        let b = user_task(&mut k);
        spawn(&mut k, a, 100);
        k.preempt_point();
        assert_eq!(k.exception_raise(a, EXC_TRAP), Err(KernError::InvalidState));
        assert_eq!(k.exception_raise(a, NEXC), Err(KernError::InvalidArgument));
        let kt = k.kernel_task();
        assert_eq!(k.exception_raise(kt, EXC_TRAP), Err(KernError::PermissionDenied));

        k.task_setcap(a, Capabilities::empty()).unwrap();
        assert_eq!(k.exception_raise(b, EXC_TRAP), Err(KernError::PermissionDenied));
    }

    #[test]
    fn test_wait_receives_exception_number() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let waiter = spawn(&mut k, task, 50);
        let raiser = spawn(&mut k, task, 100);
        k.preempt_point();
        assert_eq!(k.current(), waiter);
        k.exception_setup(Some(HANDLER)).unwrap();
        assert!(k.exception_wait().unwrap().is_blocked());
        assert_eq!(k.current(), raiser);

        k.exception_raise(task, EXC_FPE).unwrap();
        k.preempt_point();
        assert_eq!(k.current(), waiter);
        assert_eq!(k.thread_result(waiter), Ok(EXC_FPE as usize));
        assert_eq!(k.exception_pending(task), 0);
    }

    #[test]
    fn test_pending_exception_returned_by_wait() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        spawn(&mut k, task, 100);
        k.preempt_point();
        k.exception_setup(Some(HANDLER)).unwrap();
        k.exception_raise(task, EXC_SEGV).unwrap();
        assert_eq!(k.exception_wait(), Ok(Completion::Done(EXC_SEGV)));
    }

    #[test]
    fn test_exception_interrupts_sleep_and_reports_remaining() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let sleeper = spawn(&mut k, task, 50);
        let raiser = spawn(&mut k, task, 100);
        k.preempt_point();
        k.exception_setup(Some(HANDLER)).unwrap();
        let buf = k.vm_allocate(task, 0, 4096, true).unwrap();
        assert!(k.timer_sleep(100, Some(buf)).unwrap().is_blocked());
        assert_eq!(k.current(), raiser);

        for _ in 0..3 {
            k.clock_tick();
        }
        k.exception_raise(task, EXC_ILL).unwrap();
        k.preempt_point();
        assert_eq!(k.current(), sleeper);
        // the handler runs first; its saved context carries the result
        assert_eq!(k.thread_context(sleeper).unwrap().arg, EXC_ILL as usize);
        k.exception_return().unwrap();
        assert_eq!(k.thread_result(sleeper), Err(KernError::Interrupted));

        let mut left = [0u8; 4];
        k.copy_from_task(task, buf, &mut left).unwrap();
        assert_eq!(u32::from_ne_bytes(left), 70);
    }

    #[test]
    fn test_alarm_posts_exc_alrm() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let tid = spawn(&mut k, task, 100);
        k.preempt_point();
        k.exception_setup(Some(HANDLER)).unwrap();
        k.timer_alarm(20, None).unwrap();
        k.clock_tick();
        assert_ne!(k.thread_context(tid).unwrap().pc, HANDLER);
        k.clock_tick();
        assert_eq!(k.current(), tid);
        let ctx = k.thread_context(tid).unwrap();
        assert_eq!((ctx.pc, ctx.arg), (HANDLER, EXC_ALRM as usize));
    }

    #[test]
    fn test_unhandled_fault_terminates_task() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        spawn(&mut k, task, 100);
        k.preempt_point();
        k.exception_mark(EXC_SEGV).unwrap();
        assert_eq!(k.current(), k.sched.idle);
        assert!(!k.task_exists(task));
        k.check_invariants();
    }
}
