//! Scheduler - Run queues, thread state machine and dispatch
//!
//! Strict priority scheduling over 256 levels (0 is the highest). Threads of
//! equal priority share the CPU round robin with a fixed time slice; FIFO
//! threads run until they block or yield. There is no priority aging.
//!
//! ## Priority Bands
//!
//! - 15: timer service thread
//! - 16-31: interrupt service threads (by interrupt priority level)
//! - 33: deferred procedure calls
//! - 34-254: ordinary threads
//! - 255: idle
//!
//! ## Dispatch
//!
//! The running thread is never on a run queue. Rescheduling happens when
//! the running thread blocks or exits, and at preemption points (return
//! from a kernel call and outermost interrupt exit) when a higher priority
//! thread became ready or the time slice ran out.
//!
//! Kernel service threads carry a continuation: when one is dispatched its
//! body runs to completion, ending with the thread asleep on its event, and
//! dispatch goes on to the next thread.

use alloc::vec::Vec;

use crate::kern::event::Pending;
use crate::kern::queue::QueueHead;
use crate::kern::thread::{KernelBody, ThreadKind};
use crate::kern::Kernel;
use crate::types::{EventId, ThreadId, ZoneId};

// ============================================================================
// Constants
// ============================================================================

/// Number of priority levels
pub const NPRI: usize = 256;

/// Timer service thread
pub const PRI_TIMER: u8 = 15;
/// Base of the interrupt service thread band
pub const PRI_IST: u8 = 16;
/// Deferred procedure call thread
pub const PRI_DPC: u8 = 33;
/// Highest priority an ordinary thread may take without CAP_NICE
pub const PRI_USER: u8 = 34;
/// Default thread priority
pub const PRI_DEFAULT: u8 = 200;
/// Idle thread
pub const PRI_IDLE: u8 = 255;

// ============================================================================
// Thread State
// ============================================================================

/// Scheduling state of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// On a run queue
    Ready,
    /// The current thread
    Running,
    /// Waiting on an event
    Blocked,
    /// Stopped by a suspend request
    Suspended,
    /// Terminated, awaiting reap
    Zombie,
}

/// Scheduling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SchedPolicy {
    /// Run until block or yield
    Fifo = 0,
    /// Time sliced among equal priorities
    RoundRobin = 1,
}

impl SchedPolicy {
    pub fn from_usize(val: usize) -> Option<Self> {
        match val {
            0 => Some(Self::Fifo),
            1 => Some(Self::RoundRobin),
            _ => None,
        }
    }
}

/// Why the current thread must give up the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resched {
    /// A higher priority thread is ready; resume at the head of the queue
    Preempt,
    /// Time slice used up
    Expired,
    /// Voluntary yield
    Yield,
}

/// Context switch statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Context switches performed
    pub switches: u64,
    /// Switches caused by preemption
    pub preemptions: u64,
    /// Clock ticks spent in the idle thread
    pub idle_ticks: u64,
}

// ============================================================================
// Scheduler State
// ============================================================================

#[derive(Debug)]
pub struct SchedState {
    pub(crate) runq: [QueueHead<ThreadId>; NPRI],
    bitmap: [u32; NPRI / 32],
    pub(crate) current: ThreadId,
    pub(crate) idle: ThreadId,
    pub(crate) resched: Option<Resched>,
    pub(crate) locks: u32,
    pub(crate) slice_ticks: u32,
    pub(crate) stats: SchedStats,
    /// Terminated threads awaiting reap
    pub(crate) zombies: Vec<ThreadId>,
}

impl SchedState {
    pub(crate) fn new(slice_ticks: u32) -> Self {
        Self {
            runq: core::array::from_fn(|_| QueueHead::new()),
            bitmap: [0; NPRI / 32],
            current: ThreadId::null(),
            idle: ThreadId::null(),
            resched: None,
            locks: 0,
            slice_ticks,
            stats: SchedStats::default(),
            zombies: Vec::new(),
        }
    }

    /// Highest priority with a ready thread
    fn top(&self) -> Option<usize> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != 0)
            .map(|(i, word)| i * 32 + word.trailing_zeros() as usize)
    }

    fn request(&mut self, reason: Resched) {
        match (self.resched, reason) {
            (None, _) | (Some(Resched::Preempt), _) | (_, Resched::Yield) => {
                self.resched = Some(reason)
            }
            _ => {}
        }
    }
}

impl Kernel {
    // ========================================================================
    // Run queues
    // ========================================================================

    fn runq_enqueue(&mut self, tid: ThreadId, at_head: bool) {
        let pri = self.threads[tid].priority as usize;
        if at_head {
            self.sched.runq[pri].enqueue_head(&mut self.threads, tid);
        } else {
            self.sched.runq[pri].enqueue(&mut self.threads, tid);
        }
        self.sched.bitmap[pri / 32] |= 1 << (pri % 32);
    }

    pub(crate) fn runq_remove(&mut self, tid: ThreadId) {
        let pri = self.threads[tid].priority as usize;
        self.sched.runq[pri].remove(&mut self.threads, tid);
        if self.sched.runq[pri].is_empty() {
            self.sched.bitmap[pri / 32] &= !(1 << (pri % 32));
        }
    }

    fn runq_dequeue(&mut self) -> ThreadId {
        let pri = match self.sched.top() {
            Some(pri) => pri,
            None => panic!("sched: no runnable thread"),
        };
        let tid = self.sched.runq[pri].first().unwrap_or_else(|| panic!("sched: runq {} bitmap out of sync", pri));
        self.runq_remove(tid);
        tid
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// Is `tid` held by a thread or task suspend?
    pub(crate) fn thread_suspended(&self, tid: ThreadId) -> bool {
        let thread = &self.threads[tid];
        thread.suspend_count > 0 || self.tasks[thread.task].suspend_count > 0
    }

    /// Make a thread that just left its event (or suspension) runnable
    pub(crate) fn sched_setrun(&mut self, tid: ThreadId) {
        if self.thread_suspended(tid) {
            self.threads[tid].state = ThreadState::Suspended;
            return;
        }
        self.threads[tid].state = ThreadState::Ready;
        self.runq_enqueue(tid, false);
        let cur = self.sched.current;
        let preempt = match self.threads.get(cur) {
            Some(current) => {
                current.state != ThreadState::Running
                    || self.threads[tid].priority < current.priority
            }
            None => true,
        };
        if preempt {
            self.sched.request(Resched::Preempt);
        }
    }

    /// Re-evaluate a thread after its (or its task's) suspend count changed
    pub(crate) fn sched_update_suspend(&mut self, tid: ThreadId) {
        let suspended = self.thread_suspended(tid);
        match self.threads[tid].state {
            ThreadState::Ready if suspended => {
                self.runq_remove(tid);
                self.threads[tid].state = ThreadState::Suspended;
            }
            ThreadState::Running if suspended => {
                self.threads[tid].state = ThreadState::Suspended;
                self.sched.request(Resched::Yield);
            }
            ThreadState::Suspended if !suspended => self.sched_setrun(tid),
            _ => {}
        }
    }

    /// Change the priority of a thread, keeping its queue position valid
    pub(crate) fn sched_setpri(&mut self, tid: ThreadId, pri: u8) {
        let state = self.threads[tid].state;
        if state == ThreadState::Ready {
            self.runq_remove(tid);
            self.threads[tid].priority = pri;
            self.runq_enqueue(tid, false);
        } else {
            self.threads[tid].priority = pri;
        }
        let cur = self.sched.current;
        if let Some(top) = self.sched.top() {
            if top < self.threads[cur].priority as usize {
                self.sched.request(Resched::Preempt);
            }
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Switch to the highest priority ready thread
    fn sched_switch(&mut self) {
        let prev = self.sched.current;
        let reason = self.sched.resched.take();
        let slice = self.sched.slice_ticks;

        let mut preempted = false;
        if let Some(thread) = self.threads.get_mut(prev) {
            if thread.state == ThreadState::Running {
                thread.state = ThreadState::Ready;
                preempted = reason == Some(Resched::Preempt);
                if !preempted {
                    thread.quantum = slice;
                }
                self.runq_enqueue(prev, preempted);
            }
        }

        let next = self.runq_dequeue();
        self.threads[next].state = ThreadState::Running;
        self.sched.current = next;
        if next != prev {
            self.sched.stats.switches += 1;
            if preempted {
                self.sched.stats.preemptions += 1;
            }
            log::trace!("switch {:?} -> {:?}", prev, next);
        }

        let map = self.tasks[self.threads[next].task].map;
        if self.vm.active != Some(map) {
            self.vm_switch(map);
        }
    }

    /// Run threads until a user thread (or idle) holds the CPU
    pub(crate) fn dispatch(&mut self) {
        loop {
            self.sched_switch();
            let cur = self.sched.current;
            match self.threads[cur].kind {
                ThreadKind::Kernel(KernelBody::Idle) | ThreadKind::User => break,
                ThreadKind::Kernel(body) => self.kthread_run(cur, body),
            }
        }
        self.exception_deliver();
    }

    /// Preemption point: return from a kernel call or outermost interrupt
    pub fn preempt_point(&mut self) {
        if self.sched.resched.is_some() && self.sched.locks == 0 && self.irq.nesting == 0 {
            self.dispatch();
        } else {
            self.exception_deliver();
        }
    }

    /// Account one clock tick to the running thread
    pub(crate) fn sched_tick(&mut self) {
        let cur = self.sched.current;
        if cur == self.sched.idle {
            self.sched.stats.idle_ticks += 1;
        }
        let thread = &mut self.threads[cur];
        thread.ticks += 1;
        if cur == self.sched.idle || thread.policy != SchedPolicy::RoundRobin {
            return;
        }
        thread.quantum = thread.quantum.saturating_sub(1);
        if thread.quantum == 0 {
            self.sched.request(Resched::Expired);
        }
    }

    /// Give up the CPU to threads of equal or higher priority
    pub fn sched_yield(&mut self) {
        self.sched.request(Resched::Yield);
        self.dispatch();
    }

    /// Disable preemption (nests)
    pub fn sched_lock(&mut self) {
        self.sched.locks += 1;
    }

    /// Re-enable preemption, rescheduling if one was deferred
    pub fn sched_unlock(&mut self) {
        if self.sched.locks == 0 {
            log::error!("sched_unlock without sched_lock");
            panic!("sched_unlock: not locked");
        }
        self.sched.locks -= 1;
        if self.sched.locks == 0 {
            self.preempt_point();
        }
    }

    /// The running thread
    pub fn current(&self) -> ThreadId {
        self.sched.current
    }

    /// Scheduler statistics
    pub fn sched_stats(&self) -> SchedStats {
        self.sched.stats
    }

    /// Create a kernel service thread asleep on `ev`
    pub(crate) fn kthread_create(
        &mut self,
        body: KernelBody,
        pri: u8,
        ev: EventId,
    ) -> crate::kern::error::KernResult<ThreadId> {
        let tid = self.thread_alloc(self.kernel_task, ThreadKind::Kernel(body), pri)?;
        let thread = &mut self.threads[tid];
        thread.suspend_count = 0;
        thread.policy = SchedPolicy::Fifo;
        thread.state = ThreadState::Blocked;
        thread.wait_event = Some(ev);
        thread.pending = Some(Pending::Kernel);
        self.events[ev].queue.enqueue(&mut self.threads, tid);
        Ok(tid)
    }

    /// Run the continuation of a kernel service thread
    fn kthread_run(&mut self, tid: ThreadId, body: KernelBody) {
        match body {
            KernelBody::Timer => self.timer_thread(),
            KernelBody::Dpc => self.dpc_thread(),
            KernelBody::Ist(vector) => self.ist_thread(vector),
            KernelBody::Idle => {}
        }
        if self.threads.get(tid).map(|t| t.state) == Some(ThreadState::Running) {
            log::error!("{:?} ({:?}) returned without sleeping", tid, body);
            panic!("kernel thread {:?} did not block", body);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::kern::testutil::*;
    use crate::kern::ThreadState;

    #[test]
    fn test_higher_priority_runs_first_and_preempts() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let hi = spawn(&mut k, task, 10);
        let lo = spawn(&mut k, task, 20);
        k.preempt_point();
        assert_eq!(k.current(), hi);
        assert_eq!(k.thread_state(lo), Some(ThreadState::Ready));

        // hi blocks: lo takes over
        let _ = k.timer_sleep(30, None).unwrap();
        assert_eq!(k.current(), lo);

        // hi becomes ready again on the tick its timer expires
        let mut ticks = 0;
        while k.current() != hi {
            k.clock_tick();
            ticks += 1;
            assert!(ticks <= 4, "sleeper never woke");
        }
        assert_eq!(ticks, 3);
        assert_eq!(k.thread_state(lo), Some(ThreadState::Ready));
        assert_eq!(k.thread_result(hi), Ok(0));
        k.check_invariants();
    }

    #[test]
    fn test_round_robin_time_slice() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let a = spawn(&mut k, task, 100);
        let b = spawn(&mut k, task, 100);
        k.preempt_point();
        assert_eq!(k.current(), a);
        // 50 ms slice at 100 Hz
        for _ in 0..4 {
            k.clock_tick();
            assert_eq!(k.current(), a);
        }
        k.clock_tick();
        assert_eq!(k.current(), b);
        k.check_invariants();
    }

    #[test]
    fn test_fifo_thread_is_not_sliced() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let a = spawn(&mut k, task, 100);
        let _b = spawn(&mut k, task, 100);
        k.thread_schedparam(a, crate::kern::SchedParam::SetPolicy(crate::kern::SchedPolicy::Fifo))
            .unwrap();
        k.preempt_point();
        assert_eq!(k.current(), a);
        for _ in 0..20 {
            k.clock_tick();
        }
        assert_eq!(k.current(), a);
    }

    #[test]
    fn test_yield_rotates_equal_priority() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let a = spawn(&mut k, task, 100);
        let b = spawn(&mut k, task, 100);
        k.preempt_point();
        assert_eq!(k.current(), a);
        k.sched_yield();
        assert_eq!(k.current(), b);
        k.sched_yield();
        assert_eq!(k.current(), a);
    }

    #[test]
    fn test_sched_lock_defers_preemption() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let lo = spawn(&mut k, task, 100);
        k.preempt_point();
        assert_eq!(k.current(), lo);

        k.sched_lock();
        let hi = spawn(&mut k, task, 50);
        k.preempt_point();
        assert_eq!(k.current(), lo);
        k.sched_unlock();
        assert_eq!(k.current(), hi);
    }

    #[test]
    #[should_panic(expected = "non-blockable")]
    fn test_sleep_with_sched_locked_panics() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        spawn(&mut k, task, 100);
        k.preempt_point();
        k.sched_lock();
        let _ = k.timer_sleep(10, None);
    }

    #[test]
    fn test_idle_runs_when_nothing_ready() {
        let mut k = boot_default();
        assert_eq!(k.current(), k.sched.idle);
        k.clock_tick();
        assert_eq!(k.sched_stats().idle_ticks, 1);
    }
}
