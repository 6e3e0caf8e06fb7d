//! Consistency checks over the whole kernel state
//!
//! Cheap enough to run after every step of a test scenario; a violation is
//! a kernel bug and panics.

use alloc::collections::BTreeSet;
use core::fmt;

use crate::kern::sched::ThreadState;
use crate::kern::Kernel;
use crate::types::ThreadId;

#[cold]
fn violated(args: fmt::Arguments) -> ! {
    log::error!("invariant violated: {}", args);
    panic!("invariant violated: {}", args);
}

macro_rules! ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            violated(format_args!($($arg)*));
        }
    };
}

impl Kernel {
    /// Panic if any cross-reference in the kernel is inconsistent
    pub fn check_invariants(&self) {
        self.check_objects();
        self.check_queues();
        self.check_threads();
        self.check_messages();
        for (map, _) in self.vm.maps.iter() {
            self.vm_check_map(map);
        }
        self.vm_check_shares();
        ensure!(self.vm.pages.is_coalesced(), "page free list not coalesced");
    }

    fn check_objects(&self) {
        for (id, obj) in self.ipc.objects.iter() {
            let owner = self.tasks.get(obj.owner);
            ensure!(owner.is_some(), "{:?} owned by dead {:?}", id, obj.owner);
            ensure!(
                owner.is_some_and(|t| t.objects.iter().filter(|&&o| o == id).count() == 1),
                "{:?} not listed once by its owner",
                id
            );
            if !obj.name.is_empty() {
                ensure!(self.ipc.names.get(&obj.name) == Some(&id), "{:?} missing from name table", id);
            }
        }
        for (name, &id) in &self.ipc.names {
            ensure!(
                self.ipc.objects.get(id).is_some_and(|o| &o.name == name),
                "name {} points at {:?}",
                name,
                id
            );
        }
        for (task, t) in self.tasks.iter() {
            for &id in &t.objects {
                ensure!(
                    self.ipc.objects.get(id).is_some_and(|o| o.owner == task),
                    "{:?} lists {:?} it does not own",
                    task,
                    id
                );
            }
        }
    }

    /// Every thread sits on at most one queue
    fn check_queues(&self) {
        let mut seen = BTreeSet::new();
        let mut note = |tid: ThreadId, queue: &dyn fmt::Debug| {
            ensure!(seen.insert(tid), "{:?} queued twice (again on {:?})", tid, queue);
        };
        for (pri, runq) in self.sched.runq.iter().enumerate() {
            for tid in runq.iter(&self.threads) {
                ensure!(self.threads[tid].priority as usize == pri, "{:?} on run queue {}", tid, pri);
                note(tid, &pri);
            }
        }
        for (ev, event) in self.events.iter() {
            for tid in event.queue.iter(&self.threads) {
                ensure!(self.threads[tid].wait_event == Some(ev), "{:?} on {} it is not waiting for", tid, event.name);
                note(tid, &event.name);
            }
        }
    }

    fn check_threads(&self) {
        let mut running = 0;
        for (tid, thread) in self.threads.iter() {
            ensure!(
                self.tasks.get(thread.task).is_some_and(|t| t.threads.contains(&tid)),
                "{:?} missing from its task",
                tid
            );
            match thread.state {
                ThreadState::Running => {
                    running += 1;
                    ensure!(tid == self.sched.current, "{:?} running but not current", tid);
                    ensure!(!thread.link.is_linked(), "running {:?} is queued", tid);
                }
                ThreadState::Ready => {
                    let pri = thread.priority as usize;
                    ensure!(self.sched.runq[pri].contains(&self.threads, tid), "ready {:?} not on its run queue", tid);
                }
                ThreadState::Blocked => {
                    ensure!(thread.wait_event.is_some(), "blocked {:?} has no event", tid);
                }
                ThreadState::Suspended | ThreadState::Zombie => {
                    ensure!(
                        !thread.link.is_linked() && thread.wait_event.is_none(),
                        "{:?} {:?} but queued",
                        tid,
                        thread.state
                    );
                }
            }
            if thread.state != ThreadState::Blocked {
                ensure!(thread.wait_event.is_none(), "{:?} {:?} with a wait event", tid, thread.state);
            }
        }
        ensure!(running == 1, "{} running threads", running);
    }

    /// Transaction links point both ways
    fn check_messages(&self) {
        for (tid, thread) in self.threads.iter() {
            if let Some(peer) = thread.msg.receiver {
                ensure!(
                    self.threads.get(peer).is_some_and(|p| p.msg.sender == Some(tid)),
                    "{:?} -> receiver {:?} not linked back",
                    tid,
                    peer
                );
            }
            if let Some(peer) = thread.msg.sender {
                ensure!(
                    self.threads.get(peer).is_some_and(|p| p.msg.receiver == Some(tid)),
                    "{:?} -> sender {:?} not linked back",
                    tid,
                    peer
                );
                ensure!(thread.msg.recv_obj.is_some(), "{:?} serves {:?} without an object", tid, peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::kern::testutil::*;

    #[test]
    fn test_fresh_kernel_is_consistent() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        spawn(&mut k, task, 100);
        k.check_invariants();
        k.preempt_point();
        k.check_invariants();
    }

    #[test]
    #[should_panic(expected = "invariant violated")]
    fn test_detects_foreign_object_listing() {
        let mut k = boot_default();
        let a = user_task(&mut k);
        let b = user_task(&mut k);
        spawn(&mut k, a, 100);
        k.preempt_point();
        let obj = k.object_create("").unwrap();
        k.tasks[b].objects.push(obj);
        k.check_invariants();
    }

    #[test]
    #[should_panic(expected = "invariant violated")]
    fn test_detects_thread_state_mismatch() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        let tid = spawn(&mut k, task, 100);
        k.threads[tid].state = crate::kern::ThreadState::Suspended;
        k.check_invariants();
    }
}
