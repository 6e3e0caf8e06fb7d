//! Task Management
//!
//! A task is the unit of resource ownership: one address space, a
//! capability set, the threads running in it and the IPC objects it
//! serves. Tasks are created by other tasks (the kernel task at boot) and
//! inherit their creator's capabilities.
//!
//! Termination happens in two steps. `task_terminate` invalidates the
//! task's objects and turns its threads into zombies; when the last thread
//! is reaped the task itself is torn down and its map reference dropped.

use alloc::vec::Vec;
use heapless::String;

use crate::kern::cap::Capabilities;
use crate::kern::error::{KernError, KernResult};
use crate::kern::sched::ThreadState;
use crate::kern::timer::TimerAction;
use crate::kern::Kernel;
use crate::types::{EventId, MapId, ObjectId, TaskId, ThreadId, TimerId, VirtAddr, ZoneId};

/// Maximum task name length, in bytes
pub const MAXTASKNAME: usize = 12;

/// Address space of a new task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum VmOption {
    /// Fresh, empty map
    New = 0,
    /// Share the parent's map
    Share = 1,
    /// Copy of the parent's map
    Copy = 2,
}

impl VmOption {
    pub fn from_usize(val: usize) -> Option<Self> {
        match val {
            0 => Some(Self::New),
            1 => Some(Self::Share),
            2 => Some(Self::Copy),
            _ => None,
        }
    }
}

// ============================================================================
// Task
// ============================================================================

#[derive(Debug)]
pub struct Task {
    pub(crate) name: String<MAXTASKNAME>,
    pub(crate) caps: Capabilities,
    pub(crate) parent: Option<TaskId>,
    pub(crate) map: MapId,
    pub(crate) threads: Vec<ThreadId>,
    pub(crate) objects: Vec<ObjectId>,
    /// User exception handler entry
    pub(crate) handler: Option<VirtAddr>,
    /// Pending exception bits
    pub(crate) exc_pending: u32,
    /// Threads in `exception_wait`
    pub(crate) exc_event: EventId,
    pub(crate) alarm: TimerId,
    pub(crate) suspend_count: u32,
    /// Cleared once termination starts
    pub(crate) active: bool,
}

/// Copy `name` into a bounded task name
fn task_name(name: &str) -> KernResult<String<MAXTASKNAME>> {
    let mut s = String::new();
    s.push_str(name).map_err(|_| KernError::InvalidArgument)?;
    Ok(s)
}

impl Kernel {
    /// Allocate a task around an existing map reference
    pub(crate) fn task_alloc(
        &mut self,
        parent: Option<TaskId>,
        map: MapId,
        caps: Capabilities,
        name: &str,
    ) -> KernResult<TaskId> {
        let name = task_name(name)?;
        let exc_event = self.event_create("exception")?;
        let task = Task {
            name,
            caps,
            parent,
            map,
            threads: Vec::new(),
            objects: Vec::new(),
            handler: None,
            exc_pending: 0,
            exc_event,
            alarm: TimerId::null(),
            suspend_count: 0,
            active: true,
        };
        let id = match self.tasks.alloc(task) {
            Ok(id) => id,
            Err(err) => {
                self.event_destroy(exc_event);
                return Err(err);
            }
        };
        match self.timer_alloc(TimerAction::Alarm(id)) {
            Ok(alarm) => self.tasks[id].alarm = alarm,
            Err(err) => {
                self.tasks.free(id);
                self.event_destroy(exc_event);
                return Err(err);
            }
        }
        Ok(id)
    }

    /// Resolve a live task handle
    fn task_lookup(&self, task: TaskId) -> KernResult<&Task> {
        let t = self.tasks.get(task).ok_or(KernError::InvalidArgument)?;
        if !t.active {
            return Err(KernError::InvalidState);
        }
        Ok(t)
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Create a child of `parent`
    pub fn task_create(&mut self, parent: TaskId, opt: VmOption) -> KernResult<TaskId> {
        let p = self.task_lookup(parent)?;
        let (parent_map, caps) = (p.map, p.caps);
        self.check_task_access(parent)?;

        let map = match opt {
            VmOption::New => self.vm_create()?,
            VmOption::Share => {
                self.vm_reference(parent_map);
                parent_map
            }
            VmOption::Copy => self.vm_dup(parent_map)?,
        };
        let child = match self.task_alloc(Some(parent), map, caps, "") {
            Ok(child) => child,
            Err(err) => {
                self.vm_terminate(map);
                return Err(err);
            }
        };
        log::debug!("task_create: {:?} from {:?} ({:?})", child, parent, opt);
        Ok(child)
    }

    /// Terminate a task and everything it owns
    pub fn task_terminate(&mut self, task: TaskId) -> KernResult<()> {
        self.task_lookup(task)?;
        if task == self.kernel_task {
            return Err(KernError::PermissionDenied);
        }
        self.check_task_access(task)?;

        log::info!("task_terminate: {:?} ({})", task, self.tasks[task].name);
        self.tasks[task].active = false;
        let objects = core::mem::take(&mut self.tasks[task].objects);
        for obj in objects {
            self.object_deallocate(obj);
        }
        let alarm = self.tasks[task].alarm;
        self.timer_cancel(alarm);

        let threads = self.tasks[task].threads.clone();
        for tid in &threads {
            self.thread_destroy(*tid);
        }
        if threads.is_empty() {
            self.task_teardown(task);
        }
        if self.threads[self.sched.current].state == ThreadState::Zombie {
            self.dispatch();
        }
        Ok(())
    }

    /// Release a task with no threads left
    pub(crate) fn task_teardown(&mut self, task: TaskId) {
        debug_assert!(self.tasks[task].threads.is_empty());
        self.tasks[task].active = false;
        let objects = core::mem::take(&mut self.tasks[task].objects);
        for obj in objects {
            self.object_deallocate(obj);
        }
        let t = match self.tasks.free(task) {
            Some(t) => t,
            None => panic!("task_teardown: stale {:?}", task),
        };
        self.timer_free(t.alarm);
        self.event_destroy(t.exc_event);
        self.vm_terminate(t.map);
        log::debug!("task_teardown: {:?} ({})", task, t.name);
    }

    /// The calling task
    pub fn task_self(&self) -> TaskId {
        self.cur_task()
    }

    /// The kernel task
    pub fn kernel_task(&self) -> TaskId {
        self.kernel_task
    }

    /// Suspend every thread of a task (nests)
    pub fn task_suspend(&mut self, task: TaskId) -> KernResult<()> {
        self.task_lookup(task)?;
        if task == self.kernel_task {
            return Err(KernError::PermissionDenied);
        }
        self.check_task_access(task)?;
        self.tasks[task].suspend_count += 1;
        for tid in self.tasks[task].threads.clone() {
            self.sched_update_suspend(tid);
        }
        if self.threads[self.sched.current].state == ThreadState::Suspended {
            self.dispatch();
        }
        Ok(())
    }

    /// Undo one task suspend
    pub fn task_resume(&mut self, task: TaskId) -> KernResult<()> {
        self.task_lookup(task)?;
        self.check_task_access(task)?;
        let t = &mut self.tasks[task];
        if t.suspend_count == 0 {
            return Err(KernError::InvalidState);
        }
        t.suspend_count -= 1;
        for tid in self.tasks[task].threads.clone() {
            self.sched_update_suspend(tid);
        }
        Ok(())
    }

    /// Rename a task
    pub fn task_setname(&mut self, task: TaskId, name: &str) -> KernResult<()> {
        self.task_lookup(task)?;
        self.check_task_access(task)?;
        self.tasks[task].name = task_name(name)?;
        Ok(())
    }

    /// Name of a task
    pub fn task_name(&self, task: TaskId) -> Option<&str> {
        self.tasks.get(task).map(|t| t.name.as_str())
    }

    /// Capability set of a task
    pub fn task_getcap(&self, task: TaskId) -> KernResult<Capabilities> {
        Ok(self.task_lookup(task)?.caps)
    }

    /// Replace the capability set of a task
    pub fn task_setcap(&mut self, task: TaskId, caps: Capabilities) -> KernResult<()> {
        self.task_lookup(task)?;
        self.check_cap(Capabilities::SETPCAP)?;
        self.tasks[task].caps = caps;
        log::info!("task_setcap: {:?} -> {:?}", task, caps);
        Ok(())
    }

    /// Verify that `task` holds `cap`
    ///
    /// Servers use this to audit the (kernel-stamped) sender of a message.
    pub fn task_chkcap(&self, task: TaskId, cap: Capabilities) -> KernResult<()> {
        let t = self.task_lookup(task)?;
        if t.caps.contains(cap) {
            Ok(())
        } else {
            log::warn!("task_chkcap: {:?} ({}) lacks {:?}", task, t.name, cap);
            Err(KernError::PermissionDenied)
        }
    }

    /// Threads of a task
    pub fn task_threads(&self, task: TaskId) -> Option<&[ThreadId]> {
        self.tasks.get(task).map(|t| t.threads.as_slice())
    }

    /// Is `task` a live handle?
    pub fn task_exists(&self, task: TaskId) -> bool {
        self.tasks.contains(task)
    }
}
