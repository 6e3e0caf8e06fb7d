//! Kestrel - a small real-time microkernel core
//!
//! The kernel provides tasks with their own address spaces, threads
//! scheduled by fixed priority, synchronous message passing between tasks
//! through named objects, timers, exceptions delivered to user handlers,
//! interrupt dispatch and a device driver interface. Everything else
//! (file systems, process management, networking) is left to user-mode
//! servers built on these primitives.
//!
//! The crate carries no architecture code. A board layer boots the kernel
//! with [`kern::kernel_init`] and enters it through
//! [`Kernel::syscall`](kern::Kernel::syscall),
//! [`Kernel::interrupt`](kern::Kernel::interrupt) and
//! [`Kernel::exception_mark`](kern::Kernel::exception_mark).

#![cfg_attr(not(test), no_std)]
// Hardware register code often uses explicit bit shifts for documentation
#![allow(clippy::identity_op)]
// Kernel code often needs explicit casts for register-width arguments
#![allow(clippy::unnecessary_cast)]

extern crate alloc;

// Core types
pub mod types;

// Output
pub mod console;
pub mod logging;

// Kernel core
pub mod ipc;
pub mod kern;
pub mod vm;

// Devices
pub mod drivers;

// Boot components
pub mod boot;

pub use kern::{KernError, KernResult, Kernel, KernelConfig};

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "kestrel";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "kestrel");
        assert!(!VERSION.is_empty());
    }
}
