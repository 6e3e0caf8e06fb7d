//! Device driver framework
//!
//! Drivers live outside the kernel core. Each one contributes a [`Driver`]
//! entry to the table handed to [`Kernel::boot`]; the entries are run in
//! ascending `order` and typically create devices and attach interrupts.
//! A device is a named [`DeviceOps`] implementation that tasks open and
//! drive through the `device_*` calls.

pub mod device;

use bitflags::bitflags;

use crate::kern::error::{KernError, KernResult};
use crate::kern::Kernel;

pub use device::{DevState, DeviceInfo, MAXDEVNAME};

/// Highest driver init order
pub const MAX_ORDER: u8 = 15;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Device attributes
    pub struct DeviceFlags: u32 {
        /// Character device
        const CHR = 1 << 0;
        /// Block device
        const BLK = 1 << 1;
        /// Opening needs RAWIO
        const PROT = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Open mode
    pub struct OpenMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Notification sent to every device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevEvent {
    Suspend,
    Resume,
    Shutdown,
}

/// Device operations
///
/// Buffers are kernel memory; the kernel copies to and from the caller.
/// Operations a device does not support fail with `InvalidArgument`.
pub trait DeviceOps: Send {
    fn open(&mut self, _mode: OpenMode) -> KernResult<()> {
        Ok(())
    }

    fn close(&mut self) -> KernResult<()> {
        Ok(())
    }

    /// Read into `buf` starting at block `blkno`; returns the bytes read
    fn read(&mut self, _buf: &mut [u8], _blkno: usize) -> KernResult<usize> {
        Err(KernError::InvalidArgument)
    }

    /// Write `buf` starting at block `blkno`; returns the bytes written
    fn write(&mut self, _buf: &[u8], _blkno: usize) -> KernResult<usize> {
        Err(KernError::InvalidArgument)
    }

    fn ioctl(&mut self, _cmd: u32, _arg: usize) -> KernResult<usize> {
        Err(KernError::InvalidArgument)
    }

    fn event(&mut self, _event: DevEvent) -> KernResult<()> {
        Ok(())
    }
}

/// Driver table entry
#[derive(Clone, Copy)]
pub struct Driver {
    pub name: &'static str,
    /// Init order, 0 first
    pub order: u8,
    pub init: fn(&mut Kernel) -> KernResult<()>,
}

impl core::fmt::Debug for Driver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Driver")
            .field("name", &self.name)
            .field("order", &self.order)
            .finish()
    }
}

impl Kernel {
    /// Initialize every driver of the table, lowest order first
    ///
    /// A driver that fails to initialize is logged and skipped.
    pub(crate) fn driver_init(&mut self, drivers: &[Driver]) -> usize {
        let mut table: alloc::vec::Vec<&Driver> = drivers
            .iter()
            .filter(|d| {
                if d.order > MAX_ORDER {
                    log::error!("driver {}: bad init order {}", d.name, d.order);
                    return false;
                }
                true
            })
            .collect();
        table.sort_by_key(|d| d.order);

        let mut count = 0;
        for driver in table {
            match (driver.init)(self) {
                Ok(()) => {
                    log::debug!("driver {} initialized", driver.name);
                    count += 1;
                }
                Err(err) => log::warn!("driver {}: init failed: {}", driver.name, err),
            }
        }
        log::info!("{} of {} drivers initialized", count, drivers.len());
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil::*;
    use alloc::vec::Vec;

    static RAN: spin::Mutex<Vec<&'static str>> = spin::Mutex::new(Vec::new());

    fn init_a(_k: &mut Kernel) -> KernResult<()> {
        RAN.lock().push("a");
        Ok(())
    }

    fn init_b(_k: &mut Kernel) -> KernResult<()> {
        RAN.lock().push("b");
        Ok(())
    }

    fn init_fail(_k: &mut Kernel) -> KernResult<()> {
        RAN.lock().push("fail");
        Err(KernError::ResourceExhausted)
    }

    #[test]
    fn test_drivers_run_in_order() {
        let mut k = boot_default();
        let table = [
            Driver { name: "late", order: 9, init: init_b },
            Driver { name: "broken", order: 3, init: init_fail },
            Driver { name: "bogus", order: 16, init: init_b },
            Driver { name: "early", order: 0, init: init_a },
        ];
        assert_eq!(k.driver_init(&table), 2);
        assert_eq!(*RAN.lock(), ["a", "fail", "b"]);
    }
}
