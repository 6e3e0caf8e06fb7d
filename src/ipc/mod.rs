//! Inter-Process Communication
//!
//! Objects are the only rendezvous between tasks. A server task creates an
//! object (optionally under a global name) and receives on it; clients look
//! it up by name and send to it. Every send is synchronous: the sender stays
//! blocked until the receiver replies, and the message is copied directly
//! from the sender's buffer into the receiver's, with no kernel buffering.
//!
//! The first 16 bytes of every message are a [`msg::MsgHeader`] whose
//! `task` field is stamped by the kernel with the sending task, so a server
//! can audit the sender's capabilities with `task_chkcap`.

pub mod msg;
pub mod object;

use alloc::collections::BTreeMap;

use crate::kern::zalloc::Zone;
use crate::types::{EventId, ObjectId, ZoneId};

pub use msg::{MsgHeader, MsgState};
pub use object::{Object, ObjName};

/// Maximum message size, header included
pub const MAX_MSGSZ: usize = 4096;

/// Object name buffer size; a name holds at most `MAXOBJNAME - 1` bytes
pub const MAXOBJNAME: usize = 32;

/// Names starting with this character need `PROTSERV`
pub const PROTECTED_PREFIX: char = '!';

#[derive(Debug)]
pub struct IpcState {
    pub(crate) objects: Zone<ObjectId, Object>,
    /// Global name table
    pub(crate) names: BTreeMap<ObjName, ObjectId>,
    /// Senders waiting for a reply
    pub(crate) reply_event: EventId,
}

impl IpcState {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            objects: Zone::new("object", limit),
            names: BTreeMap::new(),
            reply_event: EventId::null(),
        }
    }
}
