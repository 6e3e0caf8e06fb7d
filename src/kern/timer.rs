//! Kernel Timers - Callouts, sleep, alarm and periodic wakeup
//!
//! All timers live on one list sorted by expiration tick. The clock
//! interrupt advances the tick counter (`lbolt`) and, when the head of the
//! list has expired, wakes the timer thread, which runs expired actions at
//! `PRI_TIMER` and re-arms periodic timers.
//!
//! The tick counter wraps. Every comparison between ticks goes through
//! [`time_after`] / [`time_before`], which compare the signed difference and
//! stay correct across the wrap.

use core::fmt;

use crate::kern::error::{KernError, KernResult};
use crate::kern::event::{Completion, Pending, WaitResult};
use crate::kern::exception::EXC_ALRM;
use crate::kern::irq::{IsrResult, IPL_CLOCK};
use crate::kern::queue::{QueueChain, QueueHead, Queued};
use crate::kern::sched::PRI_TIMER;
use crate::kern::thread::KernelBody;
use crate::kern::zalloc::Zone;
use crate::kern::Kernel;
use crate::types::{EventId, TaskId, ThreadId, TimerId, VirtAddr, ZoneId};

/// Is tick `a` after tick `b`?
pub fn time_after(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) < 0
}

/// Is tick `a` before tick `b`?
pub fn time_before(a: u32, b: u32) -> bool {
    time_after(b, a)
}

/// Callout function
pub type Callout = fn(&mut Kernel, usize);

/// What an expiring timer does
#[derive(Clone, Copy)]
pub enum TimerAction {
    /// Wake every thread sleeping on the timer's event
    Wakeup,
    /// Post `EXC_ALRM` to a task
    Alarm(TaskId),
    /// Call a function from the timer thread
    Callout(Callout, usize),
}

impl fmt::Debug for TimerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wakeup => f.write_str("Wakeup"),
            Self::Alarm(task) => write!(f, "Alarm({:?})", task),
            Self::Callout(func, arg) => write!(f, "Callout({:#x}, {:#x})", *func as usize, arg),
        }
    }
}

// ============================================================================
// Timer
// ============================================================================

#[derive(Debug)]
pub struct Timer {
    /// Tick at which the timer fires
    pub(crate) expire: u32,
    /// Re-arm interval in ticks, 0 for one-shot
    pub(crate) interval: u32,
    pub(crate) action: TimerAction,
    /// Sleepers, for `Wakeup` timers
    pub(crate) event: Option<EventId>,
    pub(crate) active: bool,
    /// Released by the kernel after it fires
    pub(crate) oneshot: bool,
    pub(crate) link: QueueChain<TimerId>,
}

impl Queued<TimerId> for Timer {
    fn chain(&self) -> &QueueChain<TimerId> {
        &self.link
    }

    fn chain_mut(&mut self) -> &mut QueueChain<TimerId> {
        &mut self.link
    }
}

#[derive(Debug)]
pub struct TimerState {
    pub(crate) timers: Zone<TimerId, Timer>,
    /// Active timers, sorted by expiration
    pub(crate) list: QueueHead<TimerId>,
    /// Ticks since boot (wraps)
    pub(crate) lbolt: u32,
    pub(crate) hz: u32,
    pub(crate) thread: ThreadId,
    pub(crate) event: EventId,
}

impl TimerState {
    pub(crate) fn new(hz: u32, initial_ticks: u32, limit: usize) -> Self {
        Self {
            timers: Zone::new("timer", limit),
            list: QueueHead::new(),
            lbolt: initial_ticks,
            hz,
            thread: ThreadId::null(),
            event: EventId::null(),
        }
    }

    /// Milliseconds to ticks, rounded up, at least one
    pub(crate) fn ms_to_ticks(&self, ms: u32) -> u32 {
        let ticks = (ms as u64 * self.hz as u64).div_ceil(1000);
        ticks.clamp(1, i32::MAX as u64) as u32
    }

    pub(crate) fn ticks_to_ms(&self, ticks: u32) -> u32 {
        (ticks as u64 * 1000 / self.hz as u64).min(u32::MAX as u64) as u32
    }
}

fn clock_isr(k: &mut Kernel, _arg: usize) -> IsrResult {
    k.timer_handler();
    IsrResult::Done
}

impl Kernel {
    /// Start the timer thread and hook the clock interrupt
    pub(crate) fn timer_init(&mut self) -> KernResult<()> {
        let ev = self.event_create("timer")?;
        self.timer.event = ev;
        self.timer.thread = self.kthread_create(KernelBody::Timer, PRI_TIMER, ev)?;
        self.irq_attach(self.config.clock_irq, IPL_CLOCK, clock_isr, None, 0)?;
        log::info!("timer: {} Hz, tick {}", self.timer.hz, self.timer.lbolt);
        Ok(())
    }

    // ========================================================================
    // Timer list
    // ========================================================================

    pub(crate) fn timer_alloc(&mut self, action: TimerAction) -> KernResult<TimerId> {
        let event = match action {
            TimerAction::Wakeup => Some(self.event_create("timer")?),
            _ => None,
        };
        let timer = Timer {
            expire: 0,
            interval: 0,
            action,
            event,
            active: false,
            oneshot: false,
            link: QueueChain::new(),
        };
        self.timer.timers.alloc(timer).inspect_err(|_| {
            if let Some(ev) = event {
                self.event_destroy(ev);
            }
        })
    }

    /// Release a timer; threads still sleeping on it fail with `ObjectDeleted`
    pub(crate) fn timer_free(&mut self, id: TimerId) {
        self.timer_cancel(id);
        match self.timer.timers.free(id) {
            Some(Timer { event: Some(ev), .. }) => {
                self.sched_wakeup(ev, WaitResult::Invalidated);
                self.event_destroy(ev);
            }
            Some(_) => {}
            None => panic!("timer_free: stale {:?}", id),
        }
    }

    /// Insert a timer at an absolute expiration tick
    fn timer_insert(&mut self, id: TimerId, expire: u32) {
        let ts = &mut self.timer;
        ts.timers[id].expire = expire;
        ts.timers[id].active = true;
        let mut at = ts.list.first();
        while let Some(t) = at {
            if time_after(ts.timers[t].expire, expire) {
                ts.list.insert_before(&mut ts.timers, t, id);
                return;
            }
            at = ts.list.next(&ts.timers, t);
        }
        ts.list.enqueue(&mut ts.timers, id);
    }

    /// (Re)arm a timer `ticks` from now
    pub(crate) fn timer_add(&mut self, id: TimerId, ticks: u32) {
        self.timer_cancel(id);
        let expire = self.timer.lbolt.wrapping_add(ticks);
        self.timer_insert(id, expire);
    }

    /// Take a timer off the list
    pub(crate) fn timer_cancel(&mut self, id: TimerId) {
        let ts = &mut self.timer;
        if ts.timers[id].active {
            ts.list.remove(&mut ts.timers, id);
            ts.timers[id].active = false;
        }
    }

    /// Ticks until a timer fires, 0 when stopped
    pub(crate) fn timer_remaining(&self, id: TimerId) -> u32 {
        let timer = &self.timer.timers[id];
        if !timer.active || !time_after(timer.expire, self.timer.lbolt) {
            return 0;
        }
        timer.expire.wrapping_sub(self.timer.lbolt)
    }

    // ========================================================================
    // Clock
    // ========================================================================

    /// Clock interrupt handler
    pub(crate) fn timer_handler(&mut self) {
        self.timer.lbolt = self.timer.lbolt.wrapping_add(1);
        self.sched_tick();
        if let Some(head) = self.timer.list.first() {
            if !time_before(self.timer.lbolt, self.timer.timers[head].expire) {
                self.sched_wakeup(self.timer.event, WaitResult::Normal);
            }
        }
    }

    /// Timer thread body: fire everything that expired
    pub(crate) fn timer_thread(&mut self) {
        while let Some(id) = self.timer.list.first() {
            let (expire, interval, action, oneshot, event) = {
                let t = &self.timer.timers[id];
                (t.expire, t.interval, t.action, t.oneshot, t.event)
            };
            if time_before(self.timer.lbolt, expire) {
                break;
            }
            self.timer_cancel(id);
            if interval > 0 {
                self.timer_insert(id, expire.wrapping_add(interval));
            } else if oneshot {
                self.timer_free(id);
            }
            log::trace!("timer {:?} fired at {} ({:?})", id, self.timer.lbolt, action);
            match action {
                TimerAction::Wakeup => {
                    if let Some(ev) = event {
                        self.sched_wakeup(ev, WaitResult::TimedOut);
                    }
                }
                TimerAction::Alarm(task) => self.exception_post(task, EXC_ALRM),
                TimerAction::Callout(func, arg) => func(self, arg),
            }
        }
        self.sched_block(self.timer.event, Pending::Kernel);
    }

    /// Raise one clock interrupt
    pub fn clock_tick(&mut self) {
        self.interrupt(self.config.clock_irq);
    }

    /// Ticks since boot
    pub fn timer_ticks(&self) -> u32 {
        self.timer.lbolt
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Sleep for `ms` milliseconds
    ///
    /// An exception interrupts the sleep; the time left is then stored at
    /// `remain` as a `u32` of milliseconds.
    pub fn timer_sleep(&mut self, ms: u32, remain: Option<VirtAddr>) -> KernResult<Completion<()>> {
        if ms == 0 {
            return Ok(Completion::Done(()));
        }
        let cur = self.sched.current;
        let timer = self.threads[cur].sleep_timer;
        let ticks = self.timer.ms_to_ticks(ms);
        self.timer_add(timer, ticks);
        let ev = match self.timer.timers[timer].event {
            Some(ev) => ev,
            None => panic!("timer_sleep: sleep timer without event"),
        };
        Ok(self.sched_sleep(ev, Pending::Sleep { remain }))
    }

    /// Finish an interrupted or expired sleep
    pub(crate) fn timer_sleep_done(
        &mut self,
        tid: ThreadId,
        remain: Option<VirtAddr>,
        result: WaitResult,
    ) -> KernResult<usize> {
        if result == WaitResult::TimedOut {
            return Ok(0);
        }
        let timer = self.threads[tid].sleep_timer;
        let left = self.timer.ticks_to_ms(self.timer_remaining(timer));
        self.timer_cancel(timer);
        if let (Some(addr), WaitResult::Interrupted) = (remain, result) {
            let task = self.threads[tid].task;
            self.copy_to_task(task, addr, &left.to_ne_bytes())?;
        }
        result.into_result()
    }

    /// Schedule `EXC_ALRM` for the calling task in `ms` (0 cancels)
    pub fn timer_alarm(&mut self, ms: u32, remain: Option<VirtAddr>) -> KernResult<()> {
        let task = self.cur_task();
        let alarm = self.tasks[task].alarm;
        if let Some(addr) = remain {
            let left = self.timer.ticks_to_ms(self.timer_remaining(alarm));
            self.copyout(&left.to_ne_bytes(), addr)?;
        }
        self.timer_cancel(alarm);
        if ms > 0 {
            let ticks = self.timer.ms_to_ticks(ms);
            self.timer_add(alarm, ticks);
        }
        Ok(())
    }

    /// Program a periodic timer for a thread of the calling task
    ///
    /// A zero `period` stops the timer.
    pub fn timer_periodic(&mut self, tid: ThreadId, start: u32, period: u32) -> KernResult<()> {
        let thread = self.threads.get(tid).ok_or(KernError::InvalidArgument)?;
        if thread.task != self.cur_task() {
            return Err(KernError::PermissionDenied);
        }
        let existing = thread.periodic;
        if period == 0 {
            if let Some(timer) = existing {
                self.timer_free(timer);
                self.threads[tid].periodic = None;
            }
            return Ok(());
        }
        let timer = match existing {
            Some(timer) => timer,
            None => {
                let timer = self.timer_alloc(TimerAction::Wakeup)?;
                self.threads[tid].periodic = Some(timer);
                timer
            }
        };
        self.timer.timers[timer].interval = self.timer.ms_to_ticks(period);
        let ticks = self.timer.ms_to_ticks(start);
        self.timer_add(timer, ticks);
        Ok(())
    }

    /// Wait for the next period of the calling thread's periodic timer
    pub fn timer_waitperiod(&mut self) -> KernResult<Completion<()>> {
        let cur = self.sched.current;
        let timer = self.threads[cur].periodic.ok_or(KernError::InvalidArgument)?;
        let t = &self.timer.timers[timer];
        let ev = match (t.active, t.event) {
            (true, Some(ev)) => ev,
            _ => return Err(KernError::InvalidArgument),
        };
        Ok(self.sched_sleep(ev, Pending::WaitPeriod))
    }

    /// Call `func(arg)` from the timer thread in `ms` milliseconds
    pub fn timer_callout(&mut self, ms: u32, func: Callout, arg: usize) -> KernResult<TimerId> {
        let id = self.timer_alloc(TimerAction::Callout(func, arg))?;
        self.timer.timers[id].oneshot = true;
        let ticks = self.timer.ms_to_ticks(ms);
        self.timer_add(id, ticks);
        Ok(id)
    }

    /// Cancel a pending callout
    pub fn timer_stop(&mut self, id: TimerId) -> KernResult<()> {
        match self.timer.timers.get(id) {
            Some(t) if t.oneshot => {
                self.timer_free(id);
                Ok(())
            }
            _ => Err(KernError::InvalidArgument),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::startup::KernelConfig;
    use crate::kern::testutil::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_wrap_safe_compare() {
        assert!(time_after(5, 3));
        assert!(!time_after(3, 5));
        assert!(time_after(2, u32::MAX - 2));
        assert!(time_before(u32::MAX - 2, 2));
        assert!(!time_after(7, 7));
    }

    #[test]
    fn test_ms_to_ticks_rounds_up() {
        let ts = TimerState::new(100, 0, 1);
        assert_eq!(ts.ms_to_ticks(1), 1);
        assert_eq!(ts.ms_to_ticks(10), 1);
        assert_eq!(ts.ms_to_ticks(11), 2);
        assert_eq!(ts.ms_to_ticks(1000), 100);
        assert_eq!(ts.ticks_to_ms(3), 30);
    }

    static WRAP_FIRED: AtomicUsize = AtomicUsize::new(0);

    fn count_wrap(_k: &mut Kernel, _arg: usize) {
        WRAP_FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_callout_across_tick_wrap_fires_once() {
        let mut k = boot_with(KernelConfig::default().with_initial_ticks(u32::MAX - 50));
        k.timer_callout(1000, count_wrap, 0).unwrap();
        for _ in 0..99 {
            k.clock_tick();
        }
        assert_eq!(WRAP_FIRED.load(Ordering::SeqCst), 0);
        k.clock_tick();
        assert_eq!(WRAP_FIRED.load(Ordering::SeqCst), 1);
        for _ in 0..50 {
            k.clock_tick();
        }
        assert_eq!(WRAP_FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(k.timer_ticks(), 99);
        assert!(k.timer.list.is_empty());
    }

    #[test]
    fn test_sleep_across_tick_wrap() {
        let mut k = boot_with(KernelConfig::default().with_initial_ticks(u32::MAX - 50));
        let task = user_task(&mut k);
        let tid = spawn(&mut k, task, 100);
        k.preempt_point();
        assert!(k.timer_sleep(1000, None).unwrap().is_blocked());
        for _ in 0..99 {
            k.clock_tick();
        }
        assert_eq!(k.current(), k.sched.idle);
        k.clock_tick();
        assert_eq!(k.current(), tid);
        assert_eq!(k.thread_result(tid), Ok(0));
    }

    static STOPPED_FIRED: AtomicUsize = AtomicUsize::new(0);

    fn count_stopped(_k: &mut Kernel, _arg: usize) {
        STOPPED_FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_timer_stop_cancels_callout() {
        let mut k = boot_default();
        let id = k.timer_callout(20, count_stopped, 7).unwrap();
        k.clock_tick();
        k.timer_stop(id).unwrap();
        for _ in 0..5 {
            k.clock_tick();
        }
        assert_eq!(STOPPED_FIRED.load(Ordering::SeqCst), 0);
        assert_eq!(k.timer_stop(id), Err(KernError::InvalidArgument));
    }

    #[test]
    fn test_list_stays_sorted() {
        let mut k = boot_default();
        k.timer_callout(50, count_stopped, 0).unwrap();
        k.timer_callout(10, count_stopped, 0).unwrap();
        k.timer_callout(30, count_stopped, 0).unwrap();
        let ts = &k.timer;
        let expires: alloc::vec::Vec<u32> = ts.list.iter(&ts.timers).map(|id| ts.timers[id].expire).collect();
        assert_eq!(expires, [1, 3, 5]);
    }

    #[test]
    fn test_periodic_wakeups() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let tid = spawn(&mut k, task, 100);
        k.preempt_point();
        k.timer_periodic(tid, 20, 30).unwrap();
        assert!(k.timer_waitperiod().unwrap().is_blocked());
        k.clock_tick();
        assert_eq!(k.current(), k.sched.idle);
        k.clock_tick();
        assert_eq!(k.current(), tid);

        assert!(k.timer_waitperiod().unwrap().is_blocked());
        k.clock_tick();
        k.clock_tick();
        assert_eq!(k.current(), k.sched.idle);
        k.clock_tick();
        assert_eq!(k.current(), tid);
        assert_eq!(k.thread_result(tid), Ok(0));

        k.timer_periodic(tid, 0, 0).unwrap();
        assert_eq!(k.timer_waitperiod(), Err(KernError::InvalidArgument));
    }

    #[test]
    fn test_stopping_periodic_wakes_waiter() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let waiter = spawn(&mut k, task, 50);
        let other = spawn(&mut k, task, 100);
        k.preempt_point();
        assert_eq!(k.current(), waiter);
        k.timer_periodic(waiter, 20, 30).unwrap();
        assert!(k.timer_waitperiod().unwrap().is_blocked());
        assert_eq!(k.current(), other);

        k.timer_periodic(waiter, 0, 0).unwrap();
        assert_eq!(k.threads[waiter].periodic, None);
        assert_eq!(k.thread_result(waiter), Err(KernError::ObjectDeleted));
        k.check_invariants();
        k.preempt_point();
        assert_eq!(k.current(), waiter);
        assert_eq!(k.timer_waitperiod(), Err(KernError::InvalidArgument));
    }

    #[test]
    fn test_periodic_for_other_task_denied() {
        let mut k = boot_default();
        let a = user_task(&mut k);
        let b = user_task(&mut k);
        let ta = spawn(&mut k, a, 100);
        let tb = k.thread_create(b).unwrap();
        k.preempt_point();
        assert_eq!(k.current(), ta);
        assert_eq!(k.timer_periodic(tb, 10, 10), Err(KernError::PermissionDenied));
    }
}
