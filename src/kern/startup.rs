//! Kernel Startup - Bootstrap sequence
//!
//! The kernel is brought up in one fixed order; each step may rely on
//! everything before it and nothing is ever initialized twice.
//!
//! ## Startup Sequence
//!
//! 1. Logger
//! 2. Physical memory: page allocator, reserved ranges, module images
//! 3. Kernel task and its idle thread (the first current thread)
//! 4. Timer thread and clock interrupt
//! 5. IPC reply queue
//! 6. Deferred procedure call thread
//! 7. Driver table
//! 8. Bootstrap tasks from the boot modules
//!
//! The architecture layer keeps the booted kernel in the [`KERNEL`] slot
//! and enters it from its trap and interrupt stubs.

use alloc::vec::Vec;
use log::LevelFilter;
use spin::{Mutex, Once};

use crate::boot::{BootInfo, ModuleImage};
use crate::drivers::{DevState, Driver};
use crate::ipc::IpcState;
use crate::kern::cap::Capabilities;
use crate::kern::dpc::DpcState;
use crate::kern::error::{KernError, KernResult};
use crate::kern::irq::IrqState;
use crate::kern::sched::{SchedPolicy, SchedState, ThreadState, PRI_IDLE};
use crate::kern::thread::{KernelBody, ThreadKind};
use crate::kern::timer::TimerState;
use crate::kern::zalloc::Zone;
use crate::kern::Kernel;
use crate::types::{TaskId, ZoneId};
use crate::vm::{page_round, page_trunc, VmMode, VmState};

// ============================================================================
// Configuration
// ============================================================================

/// Boot-time kernel parameters
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Clock interrupts per second
    pub hz: u32,
    /// Round-robin quantum
    pub time_slice_ms: u32,
    pub vm_mode: VmMode,
    /// Start value of the tick counter
    pub initial_ticks: u32,
    pub max_tasks: usize,
    pub max_threads: usize,
    pub max_objects: usize,
    pub max_events: usize,
    pub max_timers: usize,
    pub max_maps: usize,
    pub max_segments: usize,
    pub max_devices: usize,
    /// Stack given to the main thread of a bootstrap task
    pub user_stack_size: usize,
    /// Interrupt vectors
    pub nirqs: usize,
    /// Vector of the clock interrupt
    pub clock_irq: usize,
    pub log_level: LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            hz: 100,
            time_slice_ms: 50,
            vm_mode: VmMode::Paged,
            initial_ticks: 0,
            max_tasks: 64,
            max_threads: 128,
            max_objects: 128,
            max_events: 512,
            max_timers: 256,
            max_maps: 64,
            max_segments: 1024,
            max_devices: 32,
            user_stack_size: 16 * 1024,
            nirqs: 32,
            clock_irq: 0,
            log_level: LevelFilter::Info,
        }
    }
}

impl KernelConfig {
    pub fn with_hz(mut self, hz: u32) -> Self {
        self.hz = hz;
        self
    }

    pub fn with_time_slice_ms(mut self, ms: u32) -> Self {
        self.time_slice_ms = ms;
        self
    }

    pub fn with_vm_mode(mut self, mode: VmMode) -> Self {
        self.vm_mode = mode;
        self
    }

    pub fn with_initial_ticks(mut self, ticks: u32) -> Self {
        self.initial_ticks = ticks;
        self
    }

    pub fn with_max_tasks(mut self, n: usize) -> Self {
        self.max_tasks = n;
        self
    }

    pub fn with_max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn with_max_objects(mut self, n: usize) -> Self {
        self.max_objects = n;
        self
    }

    pub fn with_user_stack_size(mut self, size: usize) -> Self {
        self.user_stack_size = size;
        self
    }

    pub fn with_clock_irq(mut self, vector: usize) -> Self {
        self.clock_irq = vector;
        self
    }

    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    fn validate(&self) -> KernResult<()> {
        if self.hz == 0 || self.hz > 1000 || self.time_slice_ms == 0 {
            return Err(KernError::InvalidArgument);
        }
        if self.clock_irq >= self.nirqs || self.user_stack_size == 0 {
            return Err(KernError::InvalidArgument);
        }
        Ok(())
    }

    /// Quantum in clock ticks
    pub fn slice_ticks(&self) -> u32 {
        (self.time_slice_ms * self.hz).div_ceil(1000).max(1)
    }
}

// ============================================================================
// Boot
// ============================================================================

/// The booted kernel
pub static KERNEL: Once<Mutex<Kernel>> = Once::new();

/// Boot the kernel into [`KERNEL`]
pub fn kernel_init(config: KernelConfig, info: &BootInfo, drivers: &[Driver]) -> KernResult<&'static Mutex<Kernel>> {
    if KERNEL.is_completed() {
        log::error!("kernel_init called twice");
        return Err(KernError::InvalidState);
    }
    let kernel = Kernel::boot(config, info, drivers)?;
    Ok(KERNEL.call_once(|| Mutex::new(kernel)))
}

impl Kernel {
    /// Bring up a kernel
    ///
    /// Returns with the highest priority bootstrap thread current, or the
    /// idle thread when there are no bootstrap tasks.
    pub fn boot(config: KernelConfig, info: &BootInfo, drivers: &[Driver]) -> KernResult<Kernel> {
        crate::logging::init(config.log_level);
        config.validate()?;
        info.validate()?;
        log::info!(
            "kestrel {}: {} KiB RAM at {:#x}, {:?}",
            crate::VERSION,
            info.ram.size / 1024,
            info.ram.base,
            config.vm_mode
        );

        let mut vm = VmState::new(
            config.vm_mode,
            info.ram.base,
            info.ram.size,
            config.max_maps,
            config.max_segments,
        );
        for range in &info.reserved {
            let base = page_trunc(range.base);
            vm.pages.reserve(base, page_round(range.end()) - base)?;
        }
        for image in &info.modules {
            let base = page_trunc(image.phys);
            let size = page_round(image.phys + image.size) - base;
            if info.reserved.iter().any(|r| r.contains(&image.range())) {
                continue;
            }
            vm.pages.reserve(base, size)?;
        }

        let mut k = Kernel {
            sched: SchedState::new(config.slice_ticks()),
            timer: TimerState::new(config.hz, config.initial_ticks, config.max_timers),
            irq: IrqState::new(config.nirqs),
            dpc: DpcState::new(),
            ipc: IpcState::new(config.max_objects),
            dev: DevState::new(config.max_devices),
            events: Zone::new("event", config.max_events),
            tasks: Zone::new("task", config.max_tasks),
            threads: Zone::new("thread", config.max_threads),
            vm,
            kernel_task: TaskId::null(),
            boot_tasks: Vec::new(),
            config,
        };

        let map = k.vm_create()?;
        k.kernel_task = k.task_alloc(None, map, Capabilities::all(), "kernel")?;
        let idle = k.thread_alloc(k.kernel_task, ThreadKind::Kernel(KernelBody::Idle), PRI_IDLE)?;
        let thread = &mut k.threads[idle];
        thread.suspend_count = 0;
        thread.policy = SchedPolicy::Fifo;
        thread.state = ThreadState::Running;
        k.sched.idle = idle;
        k.sched.current = idle;
        k.vm_switch(map);

        k.timer_init()?;
        k.ipc.reply_event = k.event_create("ipc.reply")?;
        k.dpc_init()?;
        k.driver_init(drivers);

        for image in info.modules.iter().take(info.nr_tasks) {
            let task = k.boot_task(image)?;
            k.boot_tasks.push(task);
        }
        let free = k.page_info().free;
        log::info!("kernel ready: {} tasks started, {} KiB free", k.boot_tasks.len(), free / 1024);
        k.preempt_point();
        Ok(k)
    }

    /// Turn a boot module into a running task
    fn boot_task(&mut self, image: &ModuleImage) -> KernResult<TaskId> {
        let map = self.vm_create()?;
        let name: &str = image.name.as_str();
        let short = name.get(..name.len().min(crate::kern::task::MAXTASKNAME)).unwrap_or(name);
        let task = match self.task_alloc(Some(self.kernel_task), map, Capabilities::all(), short) {
            Ok(task) => task,
            Err(err) => {
                self.vm_terminate(map);
                return Err(err);
            }
        };
        let entry = self.vm_load(task, image)?;
        let stack_size = self.config.user_stack_size;
        let stack = self.vm_allocate(task, 0, stack_size, true)?;
        let tid = self.thread_create(task)?;
        self.thread_load(tid, entry, stack + stack_size - core::mem::size_of::<usize>())?;
        self.thread_resume(tid)?;
        log::info!("boot task {} ({:?}) entry {:#x}", image.name, task, entry);
        Ok(task)
    }

    /// Tasks started from boot modules, in module order
    pub fn boot_tasks(&self) -> &[TaskId] {
        &self.boot_tasks
    }

    /// Configuration the kernel was booted with
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }
}
