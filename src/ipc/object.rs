//! IPC Objects
//!
//! An object is owned by the task that created it; only threads of the
//! owner may receive on it or destroy it. Named objects are entered in a
//! global table so other tasks can find them. Names starting with `!` are
//! reserved for servers holding `PROTSERV`.
//!
//! Destroying an object wakes everyone involved with it: queued senders,
//! waiting receivers and senders awaiting a reply all fail with
//! `ObjectDeleted`.

use heapless::String;

use crate::ipc::{MAXOBJNAME, PROTECTED_PREFIX};
use crate::kern::cap::Capabilities;
use crate::kern::error::{KernError, KernResult};
use crate::kern::event::WaitResult;
use crate::kern::Kernel;
use crate::types::{EventId, ObjectId, TaskId};

/// Bounded object name
pub type ObjName = String<MAXOBJNAME>;

#[derive(Debug)]
pub struct Object {
    /// Empty for anonymous objects
    pub(crate) name: ObjName,
    pub(crate) owner: TaskId,
    /// Senders waiting for a receiver
    pub(crate) send_event: EventId,
    /// Receivers waiting for a sender
    pub(crate) recv_event: EventId,
}

impl Object {
    fn protected(&self) -> bool {
        self.name.starts_with(PROTECTED_PREFIX)
    }
}

fn object_name(name: &str) -> KernResult<ObjName> {
    if name.len() >= MAXOBJNAME {
        return Err(KernError::InvalidArgument);
    }
    let mut s = String::new();
    s.push_str(name).map_err(|_| KernError::InvalidArgument)?;
    Ok(s)
}

impl Kernel {
    /// Create an object owned by the calling task
    ///
    /// An empty name creates an anonymous object, reachable only through
    /// its handle.
    pub fn object_create(&mut self, name: &str) -> KernResult<ObjectId> {
        let name = object_name(name)?;
        if name.starts_with(PROTECTED_PREFIX) {
            self.check_cap(Capabilities::PROTSERV)?;
        }
        if !name.is_empty() && self.ipc.names.contains_key(&name) {
            return Err(KernError::AlreadyExists);
        }

        let send_event = self.event_create("ipc.send")?;
        let recv_event = match self.event_create("ipc.recv") {
            Ok(ev) => ev,
            Err(err) => {
                self.event_destroy(send_event);
                return Err(err);
            }
        };
        let owner = self.cur_task();
        let obj = match self.ipc.objects.alloc(Object {
            name: name.clone(),
            owner,
            send_event,
            recv_event,
        }) {
            Ok(obj) => obj,
            Err(err) => {
                self.event_destroy(recv_event);
                self.event_destroy(send_event);
                return Err(err);
            }
        };
        if !name.is_empty() {
            self.ipc.names.insert(name, obj);
        }
        self.tasks[owner].objects.push(obj);
        log::debug!("object_create: {:?} \"{}\" owner {:?}", obj, self.ipc.objects[obj].name, owner);
        Ok(obj)
    }

    /// Find a named object
    pub fn object_lookup(&self, name: &str) -> KernResult<ObjectId> {
        let name = object_name(name)?;
        self.ipc.names.get(&name).copied().ok_or(KernError::NotFound)
    }

    /// Destroy an object owned by the calling task
    pub fn object_destroy(&mut self, obj: ObjectId) -> KernResult<()> {
        let object = self.ipc.objects.get(obj).ok_or(KernError::InvalidArgument)?;
        if object.owner != self.cur_task() {
            log::warn!("{:?}: destroy of foreign {:?} denied", self.cur_task(), obj);
            return Err(KernError::PermissionDenied);
        }
        if object.protected() {
            self.check_cap(Capabilities::PROTSERV)?;
        }
        let owner = object.owner;
        self.tasks[owner].objects.retain(|o| *o != obj);
        self.object_deallocate(obj);
        Ok(())
    }

    /// Tear down an object and fail every waiter
    ///
    /// The caller has already removed it from the owner's object list.
    pub(crate) fn object_deallocate(&mut self, obj: ObjectId) {
        let (send_event, recv_event) = match self.ipc.objects.get(obj) {
            Some(o) => (o.send_event, o.recv_event),
            None => panic!("object_deallocate: stale {:?}", obj),
        };
        self.sched_wakeup(send_event, WaitResult::Invalidated);
        self.sched_wakeup(recv_event, WaitResult::Invalidated);

        let reply_event = self.ipc.reply_event;
        let awaiting: alloc::vec::Vec<_> = self.events[reply_event]
            .queue
            .iter(&self.threads)
            .filter(|tid| self.threads[*tid].msg.send_obj == Some(obj))
            .collect();
        for tid in awaiting {
            self.sched_unsleep(tid, WaitResult::Invalidated);
        }

        let object = match self.ipc.objects.free(obj) {
            Some(object) => object,
            None => panic!("object_deallocate: stale {:?}", obj),
        };
        if !object.name.is_empty() {
            self.ipc.names.remove(&object.name);
        }
        self.event_destroy(object.send_event);
        self.event_destroy(object.recv_event);
        log::debug!("object_deallocate: {:?} \"{}\"", obj, object.name);
    }

    /// Owner of an object
    pub fn object_owner(&self, obj: ObjectId) -> Option<TaskId> {
        self.ipc.objects.get(obj).map(|o| o.owner)
    }

    /// Number of live objects
    pub fn object_count(&self) -> usize {
        self.ipc.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil::*;
    use crate::vm::PAGE_SIZE;

    #[test]
    fn test_create_lookup_destroy() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        spawn(&mut k, task, 100);
        k.preempt_point();

        let obj = k.object_create("console").unwrap();
        assert_eq!(k.object_lookup("console"), Ok(obj));
        assert_eq!(k.object_owner(obj), Some(task));
        assert_eq!(k.object_create("console"), Err(KernError::AlreadyExists));

        k.object_destroy(obj).unwrap();
        assert_eq!(k.object_lookup("console"), Err(KernError::NotFound));
        assert_eq!(k.object_destroy(obj), Err(KernError::InvalidArgument));
        assert!(k.tasks[task].objects.is_empty());
        k.check_invariants();
    }

    #[test]
    fn test_anonymous_objects_are_not_named() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        spawn(&mut k, task, 100);
        k.preempt_point();
        let a = k.object_create("").unwrap();
        let b = k.object_create("").unwrap();
        assert_ne!(a, b);
        assert!(k.ipc.names.is_empty());
        assert_eq!(k.object_lookup(""), Err(KernError::NotFound));
    }

    #[test]
    fn test_name_length() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        spawn(&mut k, task, 100);
        k.preempt_point();
        let longest = "n".repeat(MAXOBJNAME - 1);
        assert!(k.object_create(&longest).is_ok());
        let too_long = "n".repeat(MAXOBJNAME);
        assert_eq!(k.object_create(&too_long), Err(KernError::InvalidArgument));
        assert_eq!(k.object_lookup(&too_long), Err(KernError::InvalidArgument));
    }

    #[test]
    fn test_protected_name_needs_protserv() {
        let mut k = boot_default();
        let task = user_task(&mut k);
        spawn(&mut k, task, 100);
        k.preempt_point();
        let obj = k.object_create("!proc").unwrap();

        k.task_setcap(task, Capabilities::SETPCAP).unwrap();
        assert_eq!(k.object_create("!fs"), Err(KernError::PermissionDenied));
        assert_eq!(k.object_destroy(obj), Err(KernError::PermissionDenied));
        assert!(k.object_create("fs").is_ok());
        assert_eq!(k.object_lookup("!proc"), Ok(obj));
    }

    #[test]
    fn test_only_owner_destroys() {
        let mut k = boot_default();
        let owner = user_task(&mut k);
        let other = user_task(&mut k);
        let a = spawn(&mut k, owner, 100);
        k.preempt_point();
        let obj = k.object_create("svc").unwrap();
        let b = spawn(&mut k, other, 90);
        k.preempt_point();
        assert_eq!(k.current(), b);
        assert_eq!(k.object_destroy(obj), Err(KernError::PermissionDenied));
        assert_eq!(k.object_owner(obj), Some(owner));
        assert_ne!(a, b);
    }

    #[test]
    fn test_destroy_fails_waiting_sender() {
        let mut k = boot_default();
        let srv = user_task(&mut k);
        let cli = user_task(&mut k);
        let server = spawn(&mut k, srv, 100);
        k.preempt_point();
        let obj = k.object_create("svc").unwrap();

        let client = spawn(&mut k, cli, 50);
        k.preempt_point();
        let buf = k.vm_allocate(cli, 0, PAGE_SIZE, true).unwrap();
        assert!(k.msg_send(obj, buf, 32).unwrap().is_blocked());
        assert_eq!(k.current(), server);

        k.object_destroy(obj).unwrap();
        k.preempt_point();
        assert_eq!(k.current(), client);
        assert_eq!(k.thread_result(client), Err(KernError::ObjectDeleted));
        assert_eq!(k.threads[client].msg.send_obj, None);
        k.check_invariants();
    }

    #[test]
    fn test_task_terminate_releases_objects() {
        let mut k = boot_default();
        let srv = user_task(&mut k);
        let server = spawn(&mut k, srv, 100);
        k.preempt_point();
        let before = k.object_count();
        k.object_create("svc").unwrap();
        let buf = k.vm_allocate(srv, 0, PAGE_SIZE, true).unwrap();
        let obj = k.object_lookup("svc").unwrap();
        assert!(k.msg_receive(obj, buf, PAGE_SIZE).unwrap().is_blocked());

        // kernel context
        k.task_terminate(srv).unwrap();
        assert_eq!(k.object_count(), before);
        assert_eq!(k.object_lookup("svc"), Err(KernError::NotFound));
        assert_eq!(k.thread_state(server), Some(crate::kern::sched::ThreadState::Zombie));
        k.check_invariants();
    }
}
