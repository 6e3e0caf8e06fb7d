//! Events - Wait/Wakeup primitives
//!
//! An event is a named FIFO of blocked threads. Every suspension point in
//! the kernel (IPC queues, timers, exception wait, kernel service threads)
//! is an event. A thread is on at most one queue at a time: either a run
//! queue or exactly one event.
//!
//! Blocking records what the thread was doing ([`Pending`]). When the
//! thread is woken, the kernel finishes that call on its behalf and stores
//! the result in the thread's saved return register.

use crate::kern::error::{encode_result, KernError, KernResult};
use crate::kern::queue::QueueHead;
use crate::kern::sched::ThreadState;
use crate::kern::Kernel;
use crate::types::{EventId, ThreadId, VirtAddr};

// ============================================================================
// Wait Results
// ============================================================================

/// Why a blocked thread was woken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The awaited condition occurred
    Normal,
    /// A timer expired
    TimedOut,
    /// An exception was posted to the thread's task
    Interrupted,
    /// The object being waited on was destroyed
    Invalidated,
    /// The IPC peer went away mid-transaction
    Broken,
    /// The waiting thread itself is being destroyed
    Aborted,
}

impl WaitResult {
    /// Default mapping of a wakeup onto a call result
    pub fn into_result(self) -> KernResult<usize> {
        match self {
            Self::Normal | Self::TimedOut => Ok(0),
            Self::Interrupted | Self::Aborted => Err(KernError::Interrupted),
            Self::Invalidated => Err(KernError::ObjectDeleted),
            Self::Broken => Err(KernError::Again),
        }
    }
}

/// The call a blocked thread is suspended in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// Kernel service thread idling on its event
    Kernel,
    /// `msg_send`, queued or awaiting reply
    MsgSend,
    /// `msg_receive`
    MsgReceive,
    /// `timer_sleep`, with optional user address for the remaining time
    Sleep { remain: Option<VirtAddr> },
    /// `exception_wait`
    ExceptionWait,
    /// `timer_waitperiod`
    WaitPeriod,
}

impl Pending {
    /// Can an exception break this wait?
    pub fn interruptible(self) -> bool {
        !matches!(self, Self::Kernel)
    }
}

/// Outcome of a call that may block
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion<T> {
    /// Finished without blocking
    Done(T),
    /// The caller is blocked; its result is delivered on wakeup
    Blocked,
}

impl<T> Completion<T> {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Completion<U> {
        match self {
            Self::Done(v) => Completion::Done(f(v)),
            Self::Blocked => Completion::Blocked,
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// A wait queue
#[derive(Debug)]
pub struct Event {
    pub(crate) name: &'static str,
    pub(crate) queue: QueueHead<ThreadId>,
}

impl Kernel {
    /// Create an event
    pub(crate) fn event_create(&mut self, name: &'static str) -> KernResult<EventId> {
        self.events.alloc(Event {
            name,
            queue: QueueHead::new(),
        })
    }

    /// Destroy an event; nobody may still wait on it
    pub(crate) fn event_destroy(&mut self, ev: EventId) {
        match self.events.free(ev) {
            Some(event) if !event.queue.is_empty() => {
                log::error!("event {} destroyed with {} waiters", event.name, event.queue.len());
                panic!("event {}: destroyed with waiters", event.name);
            }
            Some(_) => {}
            None => panic!("event_destroy: stale {:?}", ev),
        }
    }

    /// First thread waiting on `ev`
    pub(crate) fn event_first(&self, ev: EventId) -> Option<ThreadId> {
        self.events[ev].queue.first()
    }

    /// Number of threads waiting on `ev`
    pub fn event_waiters(&self, ev: EventId) -> usize {
        self.events.get(ev).map_or(0, |e| e.queue.len())
    }

    /// Put the current thread to sleep on `ev` without switching
    ///
    /// Callers that need to act after the thread is queued (e.g. hand it to
    /// a peer) use this and then [`Kernel::dispatch`].
    pub(crate) fn sched_block(&mut self, ev: EventId, pending: Pending) {
        if self.sched.locks > 0 || self.irq.nesting > 0 {
            log::error!(
                "sleep on {} with sched locked ({}) or in interrupt ({})",
                self.events[ev].name,
                self.sched.locks,
                self.irq.nesting
            );
            panic!("sched_block: sleep in non-blockable context");
        }
        let cur = self.sched.current;
        let thread = &mut self.threads[cur];
        debug_assert_eq!(thread.state, ThreadState::Running);
        thread.state = ThreadState::Blocked;
        thread.wait_event = Some(ev);
        thread.pending = Some(pending);
        self.events[ev].queue.enqueue(&mut self.threads, cur);
        log::trace!("{:?} sleeps on {}", cur, self.events[ev].name);
    }

    /// Block the current thread on `ev` and run something else
    pub(crate) fn sched_sleep<T>(&mut self, ev: EventId, pending: Pending) -> Completion<T> {
        self.sched_block(ev, pending);
        self.dispatch();
        Completion::Blocked
    }

    /// Move a blocked thread to another event without waking it
    pub(crate) fn event_move(&mut self, tid: ThreadId, to: EventId) {
        let from = match self.threads[tid].wait_event {
            Some(ev) => ev,
            None => panic!("event_move: {:?} is not blocked", tid),
        };
        self.events[from].queue.remove(&mut self.threads, tid);
        self.events[to].queue.enqueue(&mut self.threads, tid);
        self.threads[tid].wait_event = Some(to);
    }

    /// Take a blocked thread off its event and finish its pending call
    ///
    /// The thread is left off every queue; the caller decides whether it
    /// becomes runnable.
    pub(crate) fn wait_cancel(&mut self, tid: ThreadId, result: WaitResult) {
        let thread = &mut self.threads[tid];
        let ev = match thread.wait_event.take() {
            Some(ev) => ev,
            None => panic!("wait_cancel: {:?} is not blocked", tid),
        };
        let pending = thread.pending.take().unwrap_or(Pending::Kernel);
        self.events[ev].queue.remove(&mut self.threads, tid);

        let ret = self.complete_wait(tid, pending, result);
        self.threads[tid].ctx.retval = encode_result(ret);
        log::trace!("{:?} leaves {} ({:?})", tid, self.events[ev].name, result);
    }

    /// Wake one specific blocked thread
    pub(crate) fn sched_unsleep(&mut self, tid: ThreadId, result: WaitResult) {
        self.wait_cancel(tid, result);
        self.sched_setrun(tid);
    }

    /// Wake the first thread waiting on `ev`
    pub(crate) fn sched_wakeone(&mut self, ev: EventId, result: WaitResult) -> Option<ThreadId> {
        let tid = self.events[ev].queue.first()?;
        self.sched_unsleep(tid, result);
        Some(tid)
    }

    /// Wake every thread waiting on `ev`, in queue order
    pub(crate) fn sched_wakeup(&mut self, ev: EventId, result: WaitResult) -> usize {
        let mut count = 0;
        while self.sched_wakeone(ev, result).is_some() {
            count += 1;
        }
        count
    }

    /// Finish the call a woken thread was blocked in
    fn complete_wait(&mut self, tid: ThreadId, pending: Pending, result: WaitResult) -> KernResult<usize> {
        match pending {
            Pending::Kernel => Ok(0),
            Pending::MsgSend => self.msg_send_done(tid, result),
            Pending::MsgReceive => self.msg_receive_done(tid, result),
            Pending::Sleep { remain } => self.timer_sleep_done(tid, remain, result),
            Pending::ExceptionWait => match result {
                WaitResult::Normal => Ok(self.threads[tid].wake_value),
                other => other.into_result(),
            },
            Pending::WaitPeriod => result.into_result(),
        }
    }
}
