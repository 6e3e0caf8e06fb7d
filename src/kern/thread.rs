//! Thread Management
//!
//! Threads are the unit of scheduling. A thread belongs to exactly one task,
//! which provides its address space and capabilities; the owner never
//! changes. New threads start suspended and run once resumed.
//!
//! Termination leaves the thread a zombie. The zombie is reaped by the
//! deferred procedure call thread, which releases its kernel stack and
//! timers and, for the last thread of a task, tears the task down.

use crate::ipc::msg::MsgState;
use crate::kern::cap::Capabilities;
use crate::kern::error::{decode_result, KernError, KernResult};
use crate::kern::event::{Pending, WaitResult};
use crate::kern::queue::{QueueChain, Queued};
use crate::kern::sched::{SchedPolicy, ThreadState, PRI_DEFAULT, PRI_IDLE, PRI_USER};
use crate::kern::timer::TimerAction;
use crate::kern::Kernel;
use crate::types::{EventId, PhysAddr, TaskId, ThreadId, TimerId, VirtAddr};
use crate::vm::PAGE_SIZE;

/// Kernel stack size
pub const KSTACK_SIZE: usize = PAGE_SIZE;

// ============================================================================
// Thread Context
// ============================================================================

/// Saved user register state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    /// Program counter
    pub pc: VirtAddr,
    /// Stack pointer
    pub sp: VirtAddr,
    /// First argument register
    pub arg: usize,
    /// Return register
    pub retval: isize,
}

/// What runs on a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// User code in its task's address space
    User,
    /// A kernel service loop
    Kernel(KernelBody),
}

/// Continuation of a kernel service thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelBody {
    Idle,
    Timer,
    Dpc,
    /// Interrupt service thread for a vector
    Ist(usize),
}

/// Scheduling parameter request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedParam {
    GetPriority,
    SetPriority(u8),
    GetPolicy,
    SetPolicy(SchedPolicy),
}

// ============================================================================
// Thread
// ============================================================================

#[derive(Debug)]
pub struct Thread {
    pub(crate) task: TaskId,
    pub(crate) kind: ThreadKind,
    pub(crate) state: ThreadState,
    pub(crate) priority: u8,
    /// Priority set by the user; the lower bound for unprivileged changes
    pub(crate) base_priority: u8,
    pub(crate) policy: SchedPolicy,
    pub(crate) quantum: u32,
    pub(crate) suspend_count: u32,
    /// Run queue or event linkage
    pub(crate) link: QueueChain<ThreadId>,
    pub(crate) wait_event: Option<EventId>,
    pub(crate) pending: Option<Pending>,
    /// Value handed over by the waker (exception number)
    pub(crate) wake_value: usize,
    pub(crate) ctx: Context,
    /// Context interrupted by an exception handler
    pub(crate) saved_ctx: Option<Context>,
    pub(crate) kstack: PhysAddr,
    pub(crate) sleep_timer: TimerId,
    pub(crate) periodic: Option<TimerId>,
    pub(crate) msg: MsgState,
    /// Clock ticks run
    pub(crate) ticks: u64,
}

impl Queued<ThreadId> for Thread {
    fn chain(&self) -> &QueueChain<ThreadId> {
        &self.link
    }

    fn chain_mut(&mut self) -> &mut QueueChain<ThreadId> {
        &mut self.link
    }
}

impl Kernel {
    /// Allocate a thread in `task`; it starts suspended
    pub(crate) fn thread_alloc(&mut self, task: TaskId, kind: ThreadKind, pri: u8) -> KernResult<ThreadId> {
        let kstack = self.page_alloc(KSTACK_SIZE)?;
        let sleep_timer = match self.timer_alloc(TimerAction::Wakeup) {
            Ok(timer) => timer,
            Err(err) => {
                self.page_free(kstack, KSTACK_SIZE);
                return Err(err);
            }
        };
        let thread = Thread {
            task,
            kind,
            state: ThreadState::Suspended,
            priority: pri,
            base_priority: pri,
            policy: SchedPolicy::RoundRobin,
            quantum: self.sched.slice_ticks,
            suspend_count: 1,
            link: QueueChain::new(),
            wait_event: None,
            pending: None,
            wake_value: 0,
            ctx: Context::default(),
            saved_ctx: None,
            kstack,
            sleep_timer,
            periodic: None,
            msg: MsgState::default(),
            ticks: 0,
        };
        let tid = match self.threads.alloc(thread) {
            Ok(tid) => tid,
            Err(err) => {
                self.timer_free(sleep_timer);
                self.page_free(kstack, KSTACK_SIZE);
                return Err(err);
            }
        };
        self.tasks[task].threads.push(tid);
        Ok(tid)
    }

    /// Resolve a thread handle for a call
    fn thread_lookup(&self, tid: ThreadId) -> KernResult<&Thread> {
        let thread = self.threads.get(tid).ok_or(KernError::InvalidArgument)?;
        if thread.state == ThreadState::Zombie {
            return Err(KernError::InvalidState);
        }
        Ok(thread)
    }

    /// Resolve a thread the caller may control
    fn thread_access(&self, tid: ThreadId) -> KernResult<TaskId> {
        let task = self.thread_lookup(tid)?.task;
        if task == self.kernel_task && self.cur_task() != self.kernel_task {
            log::warn!("{:?}: access to kernel thread {:?} denied", self.cur_task(), tid);
            return Err(KernError::PermissionDenied);
        }
        self.check_task_access(task)?;
        Ok(task)
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Create a suspended thread in `task`
    pub fn thread_create(&mut self, task: TaskId) -> KernResult<ThreadId> {
        let t = self.tasks.get(task).ok_or(KernError::InvalidArgument)?;
        if !t.active {
            return Err(KernError::InvalidState);
        }
        if task == self.kernel_task {
            return Err(KernError::PermissionDenied);
        }
        self.check_task_access(task)?;
        let tid = self.thread_alloc(task, ThreadKind::User, PRI_DEFAULT)?;
        log::debug!("thread_create: {:?} in {:?}", tid, task);
        Ok(tid)
    }

    /// Set the entry point and user stack of a thread
    pub fn thread_load(&mut self, tid: ThreadId, entry: VirtAddr, stack: VirtAddr) -> KernResult<()> {
        self.thread_access(tid)?;
        if !self.user_area(entry) || !self.user_area(stack) {
            return Err(KernError::InvalidArgument);
        }
        let thread = &mut self.threads[tid];
        thread.ctx.pc = entry;
        thread.ctx.sp = stack;
        Ok(())
    }

    /// Terminate a thread
    pub fn thread_terminate(&mut self, tid: ThreadId) -> KernResult<()> {
        self.thread_access(tid)?;
        self.thread_destroy(tid);
        if tid == self.sched.current {
            self.dispatch();
        }
        Ok(())
    }

    /// Suspend a thread (nests)
    pub fn thread_suspend(&mut self, tid: ThreadId) -> KernResult<()> {
        self.thread_access(tid)?;
        self.threads[tid].suspend_count += 1;
        self.sched_update_suspend(tid);
        if tid == self.sched.current {
            self.dispatch();
        }
        Ok(())
    }

    /// Undo one suspend
    pub fn thread_resume(&mut self, tid: ThreadId) -> KernResult<()> {
        self.thread_access(tid)?;
        let thread = &mut self.threads[tid];
        if thread.suspend_count == 0 {
            return Err(KernError::InvalidState);
        }
        thread.suspend_count -= 1;
        self.sched_update_suspend(tid);
        Ok(())
    }

    /// Let equal priority threads run
    pub fn thread_yield(&mut self) {
        self.sched_yield();
    }

    /// The calling thread
    pub fn thread_self(&self) -> ThreadId {
        self.sched.current
    }

    /// Get or set scheduling parameters
    pub fn thread_schedparam(&mut self, tid: ThreadId, param: SchedParam) -> KernResult<usize> {
        self.thread_access(tid)?;
        let nice = self.cur_capable(Capabilities::NICE);
        match param {
            SchedParam::GetPriority => Ok(self.threads[tid].priority as usize),
            SchedParam::GetPolicy => Ok(self.threads[tid].policy as usize),
            SchedParam::SetPriority(pri) => {
                if pri == PRI_IDLE {
                    return Err(KernError::InvalidArgument);
                }
                if !nice && (pri < PRI_USER || pri < self.threads[tid].base_priority) {
                    log::warn!("{:?}: raise {:?} to priority {} denied", self.cur_task(), tid, pri);
                    return Err(KernError::PermissionDenied);
                }
                self.threads[tid].base_priority = pri;
                self.sched_setpri(tid, pri);
                Ok(0)
            }
            SchedParam::SetPolicy(policy) => {
                if policy == SchedPolicy::Fifo && !nice {
                    return Err(KernError::PermissionDenied);
                }
                let slice = self.sched.slice_ticks;
                let thread = &mut self.threads[tid];
                thread.policy = policy;
                thread.quantum = slice;
                Ok(0)
            }
        }
    }

    /// Result of the last call made by a thread
    pub fn thread_result(&self, tid: ThreadId) -> KernResult<usize> {
        let thread = self.threads.get(tid).ok_or(KernError::InvalidArgument)?;
        decode_result(thread.ctx.retval)
    }

    /// Scheduling state of a thread, `None` once reaped
    pub fn thread_state(&self, tid: ThreadId) -> Option<ThreadState> {
        self.threads.get(tid).map(|t| t.state)
    }

    /// Saved user context of a thread
    pub fn thread_context(&self, tid: ThreadId) -> Option<Context> {
        self.threads.get(tid).map(|t| t.ctx)
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    /// Turn a thread into a zombie and schedule its reap
    ///
    /// A destroyed current thread keeps the CPU until the caller
    /// dispatches.
    pub(crate) fn thread_destroy(&mut self, tid: ThreadId) {
        match self.threads[tid].state {
            ThreadState::Zombie => return,
            ThreadState::Blocked => self.wait_cancel(tid, WaitResult::Aborted),
            ThreadState::Ready => self.runq_remove(tid),
            ThreadState::Running | ThreadState::Suspended => {}
        }
        self.msg_cleanup(tid);

        let sleep_timer = self.threads[tid].sleep_timer;
        self.timer_cancel(sleep_timer);
        if let Some(periodic) = self.threads[tid].periodic {
            self.timer_cancel(periodic);
        }

        self.threads[tid].state = ThreadState::Zombie;
        self.sched.zombies.push(tid);
        self.dpc_schedule(thread_reap, 0);
        log::debug!("thread_destroy: {:?}", tid);
    }
}

/// Free zombie threads; runs as a deferred procedure call
fn thread_reap(k: &mut Kernel, _arg: usize) {
    let zombies = core::mem::take(&mut k.sched.zombies);
    for tid in zombies {
        if tid == k.sched.current {
            k.sched.zombies.push(tid);
            continue;
        }
        let thread = match k.threads.free(tid) {
            Some(thread) => thread,
            None => panic!("thread_reap: stale zombie {:?}", tid),
        };
        k.page_free(thread.kstack, KSTACK_SIZE);
        k.timer_free(thread.sleep_timer);
        if let Some(periodic) = thread.periodic {
            k.timer_free(periodic);
        }

        let task = &mut k.tasks[thread.task];
        task.threads.retain(|t| *t != tid);
        if task.threads.is_empty() && thread.task != k.kernel_task {
            k.task_teardown(thread.task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil::*;

    #[test]
    fn test_create_starts_suspended() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let tid = k.thread_create(task).unwrap();
        assert_eq!(k.thread_state(tid), Some(ThreadState::Suspended));
        assert_eq!(k.thread_resume(tid), Ok(()));
        assert_eq!(k.thread_state(tid), Some(ThreadState::Ready));
        assert_eq!(k.thread_resume(tid), Err(KernError::InvalidState));
    }

    #[test]
    fn test_load_rejects_kernel_addresses() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let tid = k.thread_create(task).unwrap();
        assert_eq!(k.thread_load(tid, 0, 0x2000), Err(KernError::InvalidArgument));
        assert_eq!(k.thread_load(tid, 0x1000, 0xc000_0000), Err(KernError::InvalidArgument));
        assert_eq!(k.thread_load(tid, 0x1000, 0x2000), Ok(()));
        assert_eq!(k.thread_context(tid).unwrap().pc, 0x1000);
    }

    #[test]
    fn test_nested_suspend() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let tid = spawn(&mut k, task, 100);
        k.thread_suspend(tid).unwrap();
        k.thread_suspend(tid).unwrap();
        k.thread_resume(tid).unwrap();
        assert_eq!(k.thread_state(tid), Some(ThreadState::Suspended));
        k.thread_resume(tid).unwrap();
        assert_eq!(k.thread_state(tid), Some(ThreadState::Ready));
    }

    #[test]
    fn test_blocked_thread_suspended_on_wakeup() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let tid = spawn(&mut k, task, 100);
        k.preempt_point();
        assert!(k.timer_sleep(10, None).unwrap().is_blocked());
        k.thread_suspend(tid).unwrap();
        assert_eq!(k.thread_state(tid), Some(ThreadState::Blocked));
        k.clock_tick();
        assert_eq!(k.thread_state(tid), Some(ThreadState::Suspended));
        k.thread_resume(tid).unwrap();
        k.preempt_point();
        assert_eq!(k.current(), tid);
        k.check_invariants();
    }

    #[test]
    fn test_terminate_self_reaps() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let a = spawn(&mut k, task, 100);
        let b = spawn(&mut k, task, 100);
        k.preempt_point();
        assert_eq!(k.current(), a);
        k.thread_terminate(a).unwrap();
        assert_eq!(k.current(), b);
        assert_eq!(k.thread_state(a), None);
        assert!(k.tasks.contains(task));
        k.check_invariants();
    }

    #[test]
    fn test_last_thread_tears_down_task() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let a = spawn(&mut k, task, 100);
        k.thread_terminate(a).unwrap();
        k.preempt_point();
        assert!(!k.tasks.contains(task));
        k.check_invariants();
    }

    #[test]
    fn test_priority_needs_nice() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let tid = spawn(&mut k, task, 100);
        k.preempt_point();
        k.task_setcap(task, Capabilities::empty()).unwrap();

        assert_eq!(
            k.thread_schedparam(tid, SchedParam::SetPriority(50)),
            Err(KernError::PermissionDenied)
        );
        assert_eq!(k.thread_schedparam(tid, SchedParam::SetPriority(150)), Ok(0));
        assert_eq!(k.thread_schedparam(tid, SchedParam::GetPriority), Ok(150));
        assert_eq!(
            k.thread_schedparam(tid, SchedParam::SetPriority(120)),
            Err(KernError::PermissionDenied)
        );
        assert_eq!(
            k.thread_schedparam(tid, SchedParam::SetPolicy(SchedPolicy::Fifo)),
            Err(KernError::PermissionDenied)
        );
    }

    #[test]
    fn test_kernel_threads_are_untouchable() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        spawn(&mut k, task, 100);
        k.preempt_point();
        let idle = k.sched.idle;
        assert_eq!(k.thread_terminate(idle), Err(KernError::PermissionDenied));
        assert_eq!(k.thread_create(k.kernel_task), Err(KernError::PermissionDenied));
    }
}
