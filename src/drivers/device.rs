//! Device Registry
//!
//! Devices are created by drivers at boot and looked up by name. An open
//! device is referred to by its handle; the open count keeps a device from
//! being destroyed under its users. Data moves between the caller's
//! address space and the driver through a kernel bounce buffer, so a
//! driver never sees a user address.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use heapless::String;

use crate::drivers::{DevEvent, DeviceFlags, DeviceOps, OpenMode};
use crate::kern::cap::Capabilities;
use crate::kern::error::{KernError, KernResult};
use crate::kern::zalloc::Zone;
use crate::kern::Kernel;
use crate::types::{DeviceId, VirtAddr};

/// Device name buffer size
pub const MAXDEVNAME: usize = 12;

/// Largest single transfer
pub const MAX_IOSIZE: usize = 64 * 1024;

type DevName = String<MAXDEVNAME>;

pub struct Device {
    name: DevName,
    flags: DeviceFlags,
    ops: Box<dyn DeviceOps>,
    opens: u32,
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("opens", &self.opens)
            .finish()
    }
}

/// Snapshot of a device for `sys_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: DevName,
    pub flags: DeviceFlags,
    pub opens: u32,
}

#[derive(Debug)]
pub struct DevState {
    pub(crate) devices: Zone<DeviceId, Device>,
    pub(crate) names: BTreeMap<DevName, DeviceId>,
}

impl DevState {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            devices: Zone::new("device", limit),
            names: BTreeMap::new(),
        }
    }
}

fn dev_name(name: &str) -> KernResult<DevName> {
    if name.is_empty() || name.len() >= MAXDEVNAME {
        return Err(KernError::InvalidArgument);
    }
    let mut s = String::new();
    s.push_str(name).map_err(|_| KernError::InvalidArgument)?;
    Ok(s)
}

impl Kernel {
    /// Register a device (driver init)
    pub fn device_create(&mut self, name: &str, flags: DeviceFlags, ops: Box<dyn DeviceOps>) -> KernResult<DeviceId> {
        let name = dev_name(name)?;
        if self.dev.names.contains_key(&name) {
            return Err(KernError::AlreadyExists);
        }
        let id = self.dev.devices.alloc(Device {
            name: name.clone(),
            flags,
            ops,
            opens: 0,
        })?;
        log::info!("device {} ({:?})", name, flags);
        self.dev.names.insert(name, id);
        Ok(id)
    }

    /// Remove a device nobody has open
    pub fn device_destroy(&mut self, dev: DeviceId) -> KernResult<()> {
        let device = self.dev.devices.get(dev).ok_or(KernError::InvalidArgument)?;
        if device.opens > 0 {
            return Err(KernError::Busy);
        }
        if let Some(device) = self.dev.devices.free(dev) {
            self.dev.names.remove(&device.name);
            log::debug!("device {} destroyed", device.name);
        }
        Ok(())
    }

    fn device_lookup(&mut self, dev: DeviceId) -> KernResult<&mut Device> {
        let device = self.dev.devices.get_mut(dev).ok_or(KernError::InvalidArgument)?;
        if device.opens == 0 {
            return Err(KernError::InvalidState);
        }
        Ok(device)
    }

    /// Open a device by name
    pub fn device_open(&mut self, name: &str, mode: OpenMode) -> KernResult<DeviceId> {
        let name = dev_name(name)?;
        let id = *self.dev.names.get(&name).ok_or(KernError::NotFound)?;
        if self.dev.devices[id].flags.contains(DeviceFlags::PROT) {
            self.check_cap(Capabilities::RAWIO)?;
        }
        let device = &mut self.dev.devices[id];
        device.ops.open(mode)?;
        device.opens += 1;
        Ok(id)
    }

    /// Close a device handle
    pub fn device_close(&mut self, dev: DeviceId) -> KernResult<()> {
        let device = self.device_lookup(dev)?;
        device.ops.close()?;
        device.opens -= 1;
        Ok(())
    }

    /// Read from a device into the caller's buffer
    pub fn device_read(&mut self, dev: DeviceId, uaddr: VirtAddr, nbytes: usize, blkno: usize) -> KernResult<usize> {
        if nbytes > MAX_IOSIZE {
            return Err(KernError::InvalidArgument);
        }
        self.device_lookup(dev)?;
        self.umem_check(uaddr, nbytes, true)?;
        let mut buf = vec![0u8; nbytes];
        let n = self.dev.devices[dev].ops.read(&mut buf, blkno)?;
        let n = n.min(nbytes);
        self.copyout(&buf[..n], uaddr)?;
        Ok(n)
    }

    /// Write the caller's buffer to a device
    pub fn device_write(&mut self, dev: DeviceId, uaddr: VirtAddr, nbytes: usize, blkno: usize) -> KernResult<usize> {
        if nbytes > MAX_IOSIZE {
            return Err(KernError::InvalidArgument);
        }
        self.device_lookup(dev)?;
        let mut buf = vec![0u8; nbytes];
        self.copyin(uaddr, &mut buf)?;
        self.dev.devices[dev].ops.write(&buf, blkno)
    }

    /// Device specific control
    pub fn device_ioctl(&mut self, dev: DeviceId, cmd: u32, arg: usize) -> KernResult<usize> {
        self.device_lookup(dev)?.ops.ioctl(cmd, arg)
    }

    /// Send an event to every device
    ///
    /// Stops at the first device that refuses it unless `force` is set, in
    /// which case every device is told and the first error is returned.
    pub fn device_broadcast(&mut self, event: DevEvent, force: bool) -> KernResult<()> {
        self.check_cap(Capabilities::POWERMGMT)?;
        let mut first_err = None;
        for id in self.dev.devices.ids() {
            let device = &mut self.dev.devices[id];
            if let Err(err) = device.ops.event(event) {
                log::warn!("device {}: {:?} refused: {}", device.name, event, err);
                if !force {
                    return Err(err);
                }
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Registered devices
    pub fn device_list(&self) -> Vec<DeviceInfo> {
        self.dev
            .devices
            .iter()
            .map(|(id, d)| DeviceInfo {
                id,
                name: d.name.clone(),
                flags: d.flags,
                opens: d.opens,
            })
            .collect()
    }
}
