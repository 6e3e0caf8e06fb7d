//! Message Transfer
//!
//! A transaction is send, receive, reply. The sender blocks on the
//! object's send queue until a receiver picks it up, then on the global
//! reply queue until the receiver answers. Messages are copied exactly
//! once in each direction, straight between the two address spaces, so the
//! receiver's buffer has to be at least as large as the message and the
//! sender's buffer at least as large as the reply. A size mismatch fails
//! the call that discovers it with `Fault` and leaves the peer untouched.
//!
//! While a transaction is open the two threads point at each other
//! (`sender` / `receiver`). Whatever ends the transaction early, a wakeup
//! with an error or the death of either side, clears both links.

use core::mem::size_of;

use static_assertions::const_assert_eq;

use crate::ipc::MAX_MSGSZ;
use crate::kern::error::{KernError, KernResult};
use crate::kern::event::{Completion, Pending, WaitResult};
use crate::kern::Kernel;
use crate::types::{ObjectId, TaskId, ThreadId, VirtAddr, ZoneId};

/// Header at the start of every message
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgHeader {
    /// Sending task, filled in by the kernel
    pub task: u64,
    /// Request code, defined by the server
    pub code: u32,
    /// Reply status, defined by the server
    pub status: i32,
}

const_assert_eq!(size_of::<MsgHeader>(), 16);

impl MsgHeader {
    pub const SIZE: usize = size_of::<MsgHeader>();

    pub fn new(code: u32) -> Self {
        Self {
            code,
            ..Self::default()
        }
    }

    /// The task that sent the message
    pub fn sender(&self) -> TaskId {
        TaskId::from_raw(self.task)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.task.to_ne_bytes());
        out[8..12].copy_from_slice(&self.code.to_ne_bytes());
        out[12..16].copy_from_slice(&self.status.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| [bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]];
        let mut task = [0u8; 8];
        task.copy_from_slice(&bytes[0..8]);
        Self {
            task: u64::from_ne_bytes(task),
            code: u32::from_ne_bytes(word(8)),
            status: i32::from_ne_bytes(word(12)),
        }
    }
}

/// Per-thread IPC state
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgState {
    /// Object this thread is sending to
    pub(crate) send_obj: Option<ObjectId>,
    /// Object this thread is receiving on
    pub(crate) recv_obj: Option<ObjectId>,
    /// Sender whose message this thread is serving
    pub(crate) sender: Option<ThreadId>,
    /// Receiver serving this thread's message
    pub(crate) receiver: Option<ThreadId>,
    /// User buffer of the pending call
    pub(crate) addr: VirtAddr,
    pub(crate) size: usize,
}

/// Message buffers are non-null and hold at least a header
fn check_buffer(addr: VirtAddr, size: usize) -> KernResult<()> {
    if addr != 0 && (MsgHeader::SIZE..=MAX_MSGSZ).contains(&size) {
        Ok(())
    } else {
        Err(KernError::InvalidArgument)
    }
}

impl Kernel {
    /// Send a message and wait for the reply
    ///
    /// The reply overwrites the message in place.
    pub fn msg_send(&mut self, obj: ObjectId, addr: VirtAddr, size: usize) -> KernResult<Completion<()>> {
        check_buffer(addr, size)?;
        let (send_event, recv_event) = match self.ipc.objects.get(obj) {
            Some(o) => (o.send_event, o.recv_event),
            None => return Err(KernError::InvalidArgument),
        };
        let cur = self.sched.current;
        if self.threads[cur].msg.recv_obj == Some(obj) {
            log::warn!("{:?}: send to {:?} while serving it", cur, obj);
            return Err(KernError::Deadlock);
        }
        self.umem_check(addr, size, true)?;

        let task = self.cur_task();
        self.copyout(&task.raw().to_ne_bytes(), addr)?;
        let msg = &mut self.threads[cur].msg;
        msg.addr = addr;
        msg.size = size;
        msg.send_obj = Some(obj);

        let receiver = match self.event_first(recv_event) {
            Some(r) => r,
            None => return Ok(self.sched_sleep(send_event, Pending::MsgSend)),
        };
        let (rtask, raddr, rsize) = {
            let r = &self.threads[receiver];
            (r.task, r.msg.addr, r.msg.size)
        };
        if size > rsize {
            self.threads[cur].msg.send_obj = None;
            return Err(KernError::Fault);
        }
        if let Err(err) = self.copy_task_to_task(task, addr, rtask, raddr, size) {
            self.threads[cur].msg.send_obj = None;
            return Err(err);
        }
        self.threads[receiver].msg.sender = Some(cur);
        self.threads[cur].msg.receiver = Some(receiver);
        self.sched_unsleep(receiver, WaitResult::Normal);
        log::trace!("msg_send: {:?} -> {:?} on {:?}", cur, receiver, obj);

        let reply_event = self.ipc.reply_event;
        Ok(self.sched_sleep(reply_event, Pending::MsgSend))
    }

    /// Receive the next message sent to an object of the calling task
    pub fn msg_receive(&mut self, obj: ObjectId, addr: VirtAddr, size: usize) -> KernResult<Completion<()>> {
        let (owner, send_event, recv_event) = match self.ipc.objects.get(obj) {
            Some(o) => (o.owner, o.send_event, o.recv_event),
            None => return Err(KernError::InvalidArgument),
        };
        let task = self.cur_task();
        if owner != task {
            return Err(KernError::PermissionDenied);
        }
        let cur = self.sched.current;
        if self.threads[cur].msg.recv_obj.is_some() {
            return Err(KernError::Busy);
        }
        check_buffer(addr, size)?;
        self.umem_check(addr, size, true)?;

        let msg = &mut self.threads[cur].msg;
        msg.addr = addr;
        msg.size = size;

        let sender = match self.event_first(send_event) {
            Some(s) => s,
            None => {
                self.threads[cur].msg.recv_obj = Some(obj);
                return Ok(self.sched_sleep(recv_event, Pending::MsgReceive));
            }
        };
        let (stask, saddr, ssize) = {
            let s = &self.threads[sender];
            (s.task, s.msg.addr, s.msg.size)
        };
        if ssize > size {
            return Err(KernError::Fault);
        }
        self.copy_task_to_task(stask, saddr, task, addr, ssize)?;

        let reply_event = self.ipc.reply_event;
        self.event_move(sender, reply_event);
        self.threads[sender].msg.receiver = Some(cur);
        let msg = &mut self.threads[cur].msg;
        msg.recv_obj = Some(obj);
        msg.sender = Some(sender);
        log::trace!("msg_receive: {:?} <- {:?} on {:?}", cur, sender, obj);
        Ok(Completion::Done(()))
    }

    /// Answer the message being served on `obj`
    pub fn msg_reply(&mut self, obj: ObjectId, addr: VirtAddr, size: usize) -> KernResult<()> {
        if !self.ipc.objects.contains(obj) {
            return Err(KernError::InvalidArgument);
        }
        let cur = self.sched.current;
        let sender = match self.threads[cur].msg {
            MsgState {
                recv_obj: Some(o),
                sender: Some(s),
                ..
            } if o == obj => s,
            _ => return Err(KernError::InvalidState),
        };
        check_buffer(addr, size)?;
        self.umem_check(addr, size, false)?;

        let (stask, saddr, ssize) = {
            let s = &self.threads[sender];
            (s.task, s.msg.addr, s.msg.size)
        };
        if size > ssize {
            return Err(KernError::Fault);
        }
        let task = self.cur_task();
        self.copy_task_to_task(task, addr, stask, saddr, size)?;

        let msg = &mut self.threads[cur].msg;
        msg.recv_obj = None;
        msg.sender = None;
        self.threads[sender].msg.receiver = None;
        self.sched_unsleep(sender, WaitResult::Normal);
        log::trace!("msg_reply: {:?} -> {:?}", cur, sender);
        Ok(())
    }

    /// Finish a sender's wait
    pub(crate) fn msg_send_done(&mut self, tid: ThreadId, result: WaitResult) -> KernResult<usize> {
        let msg = &mut self.threads[tid].msg;
        msg.send_obj = None;
        let receiver = msg.receiver.take();
        if let Some(r) = receiver {
            if let Some(peer) = self.threads.get_mut(r) {
                peer.msg.sender = None;
                peer.msg.recv_obj = None;
            }
        }
        result.into_result()
    }

    /// Finish a receiver's wait
    pub(crate) fn msg_receive_done(&mut self, tid: ThreadId, result: WaitResult) -> KernResult<usize> {
        if result != WaitResult::Normal {
            let msg = &mut self.threads[tid].msg;
            msg.recv_obj = None;
            msg.sender = None;
        }
        result.into_result()
    }

    /// Break every transaction a dying thread takes part in
    pub(crate) fn msg_cleanup(&mut self, tid: ThreadId) {
        let msg = self.threads[tid].msg;
        if let Some(sender) = msg.sender {
            if self.threads.get(sender).is_some_and(|s| s.wait_event.is_some()) {
                self.sched_unsleep(sender, WaitResult::Broken);
            }
        }
        if let Some(receiver) = msg.receiver {
            if let Some(peer) = self.threads.get_mut(receiver) {
                peer.msg.sender = None;
                peer.msg.recv_obj = None;
            }
        }
        self.threads[tid].msg = MsgState::default();
    }
}
