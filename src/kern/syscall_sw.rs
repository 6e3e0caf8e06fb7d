//! System Call Switch
//!
//! The trap stub saves the user registers into the current thread's
//! context and calls [`Kernel::syscall`] with the call number and up to six
//! raw argument words. Handles travel as their packed `raw()` form; calls
//! that create something write the new handle to a user pointer. The
//! result is encoded into the caller's return register, unless the caller
//! blocked, in which case the wakeup path stores it later.
//!
//! ## Call Numbers
//!
//! - 0-5: objects and messages
//! - 6-9: virtual memory
//! - 10-17: tasks
//! - 18-25: threads
//! - 26-29: timers
//! - 30-33: exceptions
//! - 34-38: devices
//! - 39-41: host

use crate::drivers::OpenMode;
use crate::kern::cap::Capabilities;
use crate::kern::error::{encode_result, KernError, KernResult};
use crate::kern::event::Completion;
use crate::kern::host::{InfoFlavor, LOG_MAX};
use crate::kern::sched::SchedPolicy;
use crate::kern::task::VmOption;
use crate::kern::thread::SchedParam;
use crate::kern::Kernel;
use crate::types::{VirtAddr, ZoneId};
use crate::vm::SegFlags;

/// Argument registers
pub const NARGS: usize = 6;

/// Trap arguments as saved by the trap stub
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapArgs {
    pub args: [usize; NARGS],
}

impl TrapArgs {
    pub fn with_args(args: &[usize]) -> Self {
        let mut trap_args = Self::default();
        let count = args.len().min(NARGS);
        trap_args.args[..count].copy_from_slice(&args[..count]);
        trap_args
    }

    pub fn arg(&self, index: usize) -> usize {
        self.args.get(index).copied().unwrap_or(0)
    }

    pub fn arg_u32(&self, index: usize) -> u32 {
        self.arg(index) as u32
    }

    /// Handle argument
    pub fn id<I: ZoneId>(&self, index: usize) -> I {
        I::from_raw(self.arg(index) as u64)
    }

    /// Optional user pointer (0 means none)
    pub fn ptr(&self, index: usize) -> Option<VirtAddr> {
        match self.arg(index) {
            0 => None,
            addr => Some(addr),
        }
    }
}

pub type SysResult = KernResult<Completion<usize>>;

type SysHandler = fn(&mut Kernel, &TrapArgs) -> SysResult;

/// Call table entry
pub struct SysEnt {
    pub name: &'static str,
    pub nargs: usize,
    handler: SysHandler,
}

impl core::fmt::Debug for SysEnt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SysEnt")
            .field("name", &self.name)
            .field("nargs", &self.nargs)
            .finish()
    }
}

const fn ent(name: &'static str, nargs: usize, handler: SysHandler) -> SysEnt {
    SysEnt { name, nargs, handler }
}

pub const SYS_OBJECT_CREATE: usize = 0;
pub const SYS_OBJECT_DESTROY: usize = 1;
pub const SYS_OBJECT_LOOKUP: usize = 2;
pub const SYS_MSG_SEND: usize = 3;
pub const SYS_MSG_RECEIVE: usize = 4;
pub const SYS_MSG_REPLY: usize = 5;
pub const SYS_VM_ALLOCATE: usize = 6;
pub const SYS_VM_FREE: usize = 7;
pub const SYS_VM_ATTRIBUTE: usize = 8;
pub const SYS_VM_MAP: usize = 9;
pub const SYS_TASK_CREATE: usize = 10;
pub const SYS_TASK_TERMINATE: usize = 11;
pub const SYS_TASK_SELF: usize = 12;
pub const SYS_TASK_SUSPEND: usize = 13;
pub const SYS_TASK_RESUME: usize = 14;
pub const SYS_TASK_SETNAME: usize = 15;
pub const SYS_TASK_SETCAP: usize = 16;
pub const SYS_TASK_CHKCAP: usize = 17;
pub const SYS_THREAD_CREATE: usize = 18;
pub const SYS_THREAD_TERMINATE: usize = 19;
pub const SYS_THREAD_LOAD: usize = 20;
pub const SYS_THREAD_SELF: usize = 21;
pub const SYS_THREAD_YIELD: usize = 22;
pub const SYS_THREAD_SUSPEND: usize = 23;
pub const SYS_THREAD_RESUME: usize = 24;
pub const SYS_THREAD_SCHEDPARAM: usize = 25;
pub const SYS_TIMER_SLEEP: usize = 26;
pub const SYS_TIMER_ALARM: usize = 27;
pub const SYS_TIMER_PERIODIC: usize = 28;
pub const SYS_TIMER_WAITPERIOD: usize = 29;
pub const SYS_EXCEPTION_SETUP: usize = 30;
pub const SYS_EXCEPTION_RETURN: usize = 31;
pub const SYS_EXCEPTION_RAISE: usize = 32;
pub const SYS_EXCEPTION_WAIT: usize = 33;
pub const SYS_DEVICE_OPEN: usize = 34;
pub const SYS_DEVICE_CLOSE: usize = 35;
pub const SYS_DEVICE_READ: usize = 36;
pub const SYS_DEVICE_WRITE: usize = 37;
pub const SYS_DEVICE_IOCTL: usize = 38;
pub const SYS_LOG: usize = 39;
pub const SYS_INFO: usize = 40;
pub const SYS_TIME: usize = 41;

/// The call table, indexed by call number
pub static SYSENT: [SysEnt; 42] = [
    ent("object_create", 2, sys_object_create),
    ent("object_destroy", 1, sys_object_destroy),
    ent("object_lookup", 2, sys_object_lookup),
    ent("msg_send", 3, sys_msg_send),
    ent("msg_receive", 3, sys_msg_receive),
    ent("msg_reply", 3, sys_msg_reply),
    ent("vm_allocate", 4, sys_vm_allocate),
    ent("vm_free", 2, sys_vm_free),
    ent("vm_attribute", 3, sys_vm_attribute),
    ent("vm_map", 4, sys_vm_map),
    ent("task_create", 3, sys_task_create),
    ent("task_terminate", 1, sys_task_terminate),
    ent("task_self", 0, sys_task_self),
    ent("task_suspend", 1, sys_task_suspend),
    ent("task_resume", 1, sys_task_resume),
    ent("task_setname", 2, sys_task_setname),
    ent("task_setcap", 2, sys_task_setcap),
    ent("task_chkcap", 2, sys_task_chkcap),
    ent("thread_create", 2, sys_thread_create),
    ent("thread_terminate", 1, sys_thread_terminate),
    ent("thread_load", 3, sys_thread_load),
    ent("thread_self", 0, sys_thread_self),
    ent("thread_yield", 0, sys_thread_yield),
    ent("thread_suspend", 1, sys_thread_suspend),
    ent("thread_resume", 1, sys_thread_resume),
    ent("thread_schedparam", 3, sys_thread_schedparam),
    ent("timer_sleep", 2, sys_timer_sleep),
    ent("timer_alarm", 2, sys_timer_alarm),
    ent("timer_periodic", 3, sys_timer_periodic),
    ent("timer_waitperiod", 0, sys_timer_waitperiod),
    ent("exception_setup", 1, sys_exception_setup),
    ent("exception_return", 0, sys_exception_return),
    ent("exception_raise", 2, sys_exception_raise),
    ent("exception_wait", 0, sys_exception_wait),
    ent("device_open", 3, sys_device_open),
    ent("device_close", 1, sys_device_close),
    ent("device_read", 4, sys_device_read),
    ent("device_write", 4, sys_device_write),
    ent("device_ioctl", 3, sys_device_ioctl),
    ent("sys_log", 1, sys_log),
    ent("sys_info", 2, sys_info),
    ent("sys_time", 0, sys_time),
];

impl Kernel {
    /// System call entry from the trap stub
    pub fn syscall(&mut self, num: usize, args: &TrapArgs) {
        let caller = self.sched.current;
        let result = match SYSENT.get(num) {
            Some(ent) => {
                log::trace!("{:?}: {}{:x?}", caller, ent.name, &args.args[..ent.nargs]);
                (ent.handler)(self, args)
            }
            None => {
                log::warn!("{:?}: invalid system call {}", caller, num);
                Err(KernError::InvalidArgument)
            }
        };
        let ret = match result {
            Ok(Completion::Blocked) => None,
            Ok(Completion::Done(value)) => Some(Ok(value)),
            Err(err) => Some(Err(err)),
        };
        if let (Some(ret), Some(thread)) = (ret, self.threads.get_mut(caller)) {
            thread.ctx.retval = encode_result(ret);
        }
        self.preempt_point();
    }

    fn put_id<I: ZoneId>(&mut self, id: I, uaddr: VirtAddr) -> KernResult<()> {
        self.copyout(&id.raw().to_ne_bytes(), uaddr)
    }

    fn get_word(&self, uaddr: VirtAddr) -> KernResult<usize> {
        let mut bytes = [0u8; core::mem::size_of::<usize>()];
        self.copyin(uaddr, &mut bytes)?;
        Ok(usize::from_ne_bytes(bytes))
    }
}

fn done(value: usize) -> SysResult {
    Ok(Completion::Done(value))
}

fn ok(result: KernResult<()>) -> SysResult {
    result.map(|()| Completion::Done(0))
}

/// Copy in a name argument
fn name_arg(k: &Kernel, uaddr: usize) -> KernResult<alloc::string::String> {
    k.copyinstr(uaddr, LOG_MAX)
}

// ============================================================================
// IPC
// ============================================================================

fn sys_object_create(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    let name = match a.ptr(0) {
        Some(uaddr) => name_arg(k, uaddr)?,
        None => alloc::string::String::new(),
    };
    k.umem_check(a.arg(1), 8, true)?;
    let obj = k.object_create(&name)?;
    ok(k.put_id(obj, a.arg(1)))
}

fn sys_object_destroy(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.object_destroy(a.id(0)))
}

fn sys_object_lookup(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    let name = name_arg(k, a.arg(0))?;
    let obj = k.object_lookup(&name)?;
    ok(k.put_id(obj, a.arg(1)))
}

fn sys_msg_send(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    Ok(k.msg_send(a.id(0), a.arg(1), a.arg(2))?.map(|()| 0))
}

fn sys_msg_receive(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    Ok(k.msg_receive(a.id(0), a.arg(1), a.arg(2))?.map(|()| 0))
}

fn sys_msg_reply(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.msg_reply(a.id(0), a.arg(1), a.arg(2)))
}

// ============================================================================
// VM
// ============================================================================

/// `vm_allocate(task, *addr, size, anywhere)`: `*addr` is in and out
fn sys_vm_allocate(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    let uaddr = a.arg(1);
    let want = k.get_word(uaddr)?;
    k.umem_check(uaddr, core::mem::size_of::<usize>(), true)?;
    let addr = k.vm_allocate(a.id(0), want, a.arg(2), a.arg(3) != 0)?;
    ok(k.copyout(&addr.to_ne_bytes(), uaddr))
}

fn sys_vm_free(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.vm_free(a.id(0), a.arg(1)))
}

fn sys_vm_attribute(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    let attr = SegFlags::from_bits(a.arg_u32(2)).ok_or(KernError::InvalidArgument)?;
    ok(k.vm_attribute(a.id(0), a.arg(1), attr))
}

/// `vm_map(target, addr, size, *out)`
fn sys_vm_map(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    k.umem_check(a.arg(3), core::mem::size_of::<usize>(), true)?;
    let addr = k.vm_map_task(a.id(0), a.arg(1), a.arg(2))?;
    ok(k.copyout(&addr.to_ne_bytes(), a.arg(3)))
}

// ============================================================================
// Tasks
// ============================================================================

fn sys_task_create(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    let opt = VmOption::from_usize(a.arg(1)).ok_or(KernError::InvalidArgument)?;
    k.umem_check(a.arg(2), 8, true)?;
    let task = k.task_create(a.id(0), opt)?;
    ok(k.put_id(task, a.arg(2)))
}

fn sys_task_terminate(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.task_terminate(a.id(0)))
}

fn sys_task_self(k: &mut Kernel, _a: &TrapArgs) -> SysResult {
    done(k.task_self().raw() as usize)
}

fn sys_task_suspend(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.task_suspend(a.id(0)))
}

fn sys_task_resume(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.task_resume(a.id(0)))
}

fn sys_task_setname(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    let name = name_arg(k, a.arg(1))?;
    ok(k.task_setname(a.id(0), &name))
}

fn sys_task_setcap(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    let caps = Capabilities::from_bits(a.arg_u32(1)).ok_or(KernError::InvalidArgument)?;
    ok(k.task_setcap(a.id(0), caps))
}

fn sys_task_chkcap(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    let cap = Capabilities::from_bits(a.arg_u32(1)).ok_or(KernError::InvalidArgument)?;
    ok(k.task_chkcap(a.id(0), cap))
}

// ============================================================================
// Threads
// ============================================================================

fn sys_thread_create(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    k.umem_check(a.arg(1), 8, true)?;
    let tid = k.thread_create(a.id(0))?;
    ok(k.put_id(tid, a.arg(1)))
}

fn sys_thread_terminate(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.thread_terminate(a.id(0)))
}

fn sys_thread_load(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.thread_load(a.id(0), a.arg(1), a.arg(2)))
}

fn sys_thread_self(k: &mut Kernel, _a: &TrapArgs) -> SysResult {
    done(k.thread_self().raw() as usize)
}

fn sys_thread_yield(k: &mut Kernel, _a: &TrapArgs) -> SysResult {
    k.thread_yield();
    done(0)
}

fn sys_thread_suspend(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.thread_suspend(a.id(0)))
}

fn sys_thread_resume(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.thread_resume(a.id(0)))
}

/// `thread_schedparam(thread, op, value)`: 0/1 get/set priority, 2/3 get/set policy
fn sys_thread_schedparam(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    let value = a.arg(2);
    let param = match a.arg(1) {
        0 => SchedParam::GetPriority,
        1 => SchedParam::SetPriority(u8::try_from(value).map_err(|_| KernError::InvalidArgument)?),
        2 => SchedParam::GetPolicy,
        3 => SchedParam::SetPolicy(SchedPolicy::from_usize(value).ok_or(KernError::InvalidArgument)?),
        _ => return Err(KernError::InvalidArgument),
    };
    Ok(Completion::Done(k.thread_schedparam(a.id(0), param)?))
}

// ============================================================================
// Timers
// ============================================================================

fn sys_timer_sleep(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    Ok(k.timer_sleep(a.arg_u32(0), a.ptr(1))?.map(|()| 0))
}

fn sys_timer_alarm(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.timer_alarm(a.arg_u32(0), a.ptr(1)))
}

fn sys_timer_periodic(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.timer_periodic(a.id(0), a.arg_u32(1), a.arg_u32(2)))
}

fn sys_timer_waitperiod(k: &mut Kernel, _a: &TrapArgs) -> SysResult {
    Ok(k.timer_waitperiod()?.map(|()| 0))
}

// ============================================================================
// Exceptions
// ============================================================================

fn sys_exception_setup(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.exception_setup(a.ptr(0)))
}

fn sys_exception_return(k: &mut Kernel, _a: &TrapArgs) -> SysResult {
    // the restored context keeps its own return register
    k.exception_return()?;
    Ok(Completion::Blocked)
}

fn sys_exception_raise(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.exception_raise(a.id(0), a.arg_u32(1)))
}

fn sys_exception_wait(k: &mut Kernel, _a: &TrapArgs) -> SysResult {
    Ok(k.exception_wait()?.map(|exc| exc as usize))
}

// ============================================================================
// Devices
// ============================================================================

fn sys_device_open(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    let name = name_arg(k, a.arg(0))?;
    let mode = OpenMode::from_bits(a.arg_u32(1)).ok_or(KernError::InvalidArgument)?;
    k.umem_check(a.arg(2), 8, true)?;
    let dev = k.device_open(&name, mode)?;
    ok(k.put_id(dev, a.arg(2)))
}

fn sys_device_close(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    ok(k.device_close(a.id(0)))
}

fn sys_device_read(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    done(k.device_read(a.id(0), a.arg(1), a.arg(2), a.arg(3))?)
}

fn sys_device_write(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    done(k.device_write(a.id(0), a.arg(1), a.arg(2), a.arg(3))?)
}

fn sys_device_ioctl(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    done(k.device_ioctl(a.id(0), a.arg_u32(1), a.arg(2))?)
}

// ============================================================================
// Host
// ============================================================================

fn sys_log(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    k.check_cap(Capabilities::DIAG)?;
    let msg = k.copyinstr(a.arg(0), LOG_MAX)?;
    ok(k.sys_log(&msg))
}

/// `sys_info(flavor, buf)`: buf receives the words of the answer
fn sys_info(k: &mut Kernel, a: &TrapArgs) -> SysResult {
    let flavor = InfoFlavor::from_u32(a.arg_u32(0)).ok_or(KernError::InvalidArgument)?;
    let words = k.sys_info(flavor).to_words();
    let bytes: alloc::vec::Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
    k.copyout(&bytes, a.arg(1))?;
    done(words.len())
}

fn sys_time(k: &mut Kernel, _a: &TrapArgs) -> SysResult {
    done(k.sys_time() as usize)
}
