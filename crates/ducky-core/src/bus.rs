//! Device bus: registers devices and routes MMIO and I/O-port accesses to
//! the owning device.

use std::any::Any;
use std::fmt::Debug;

use crate::interrupt::InterruptController;
use crate::mem::MemoryController;
use crate::trap::{Access, Trap, VmError};

/// Console I/O ports.
pub const CONIO_STDIN: u16 = 0x100;
pub const CONIO_STDOUT: u16 = 0x100;
pub const CONIO_STDERR: u16 = 0x101;

/// Access width of a bus operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Short,
    Word,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Short => 2,
            Width::Word => 4,
        }
    }
}

/// Context handed to a device during dispatch and ticks. Side effects
/// (raising IRQs, DMA) happen synchronously through it.
pub struct DeviceCtx<'a> {
    pub mem: &'a mut MemoryController,
    pub intc: &'a mut InterruptController,
    pub clock: u64,
}

/// Descriptor data a device contributes to the HDT.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Short device name, at most 10 bytes in the HDT.
    pub name: String,
    /// Driver identifier, at most 32 bytes in the HDT.
    pub ident: String,
    pub flags: u16,
}

/// The bus contract every device implements.
pub trait Device: Debug {
    fn class(&self) -> &'static str;
    fn name(&self) -> &str;
    fn info(&self) -> DeviceInfo;
    /// IRQ line the device raises, if any.
    fn irq(&self) -> Option<u32> {
        None
    }

    fn mmio_read(&mut self, ctx: &mut DeviceCtx<'_>, offset: u32, width: Width)
        -> Result<u32, Trap>;
    fn mmio_write(
        &mut self,
        ctx: &mut DeviceCtx<'_>,
        offset: u32,
        width: Width,
        value: u32,
    ) -> Result<(), Trap>;

    fn io_read(&mut self, _ctx: &mut DeviceCtx<'_>, offset: u16) -> Result<u8, Trap> {
        Err(Trap::AccessViolation {
            addr: u32::from(offset),
            access: Access::Read,
        })
    }
    fn io_write(&mut self, _ctx: &mut DeviceCtx<'_>, offset: u16, _value: u8) -> Result<(), Trap> {
        Err(Trap::AccessViolation {
            addr: u32::from(offset),
            access: Access::Write,
        })
    }

    /// Timed device logic, run once per scheduler round.
    fn tick(&mut self, _ctx: &mut DeviceCtx<'_>) -> Result<(), VmError> {
        Ok(())
    }

    /// Serialized device state for snapshots.
    fn save_state(&self) -> Vec<u8> {
        Vec::new()
    }
    fn restore_state(&mut self, _bytes: &[u8]) -> Result<(), VmError> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Clone, Copy)]
struct MmioRegion {
    base: u32,
    size: u32,
    device: usize,
}

#[derive(Debug, Clone, Copy)]
struct PortRegion {
    base: u16,
    size: u16,
    device: usize,
}

/// The device bus.
#[derive(Debug, Default)]
pub struct Bus {
    devices: Vec<Box<dyn Device>>,
    mmio: Vec<MmioRegion>,
    ports: Vec<PortRegion>,
}

impl Bus {
    pub fn new() -> Self {
        Bus::default()
    }

    /// Register a device with optional MMIO and I/O-port regions. Regions
    /// must not overlap an existing registration.
    pub fn register(
        &mut self,
        device: Box<dyn Device>,
        mmio: Option<(u32, u32)>,
        ports: Option<(u16, u16)>,
    ) -> Result<usize, VmError> {
        if let Some((base, size)) = mmio {
            let end = base
                .checked_add(size)
                .ok_or(VmError::AddressConflict(base, size))?;
            if size == 0 {
                return Err(VmError::AddressConflict(base, size));
            }
            for region in &self.mmio {
                if base < region.base + region.size && region.base < end {
                    return Err(VmError::AddressConflict(base, size));
                }
            }
        }
        if let Some((base, size)) = ports {
            let end = base
                .checked_add(size)
                .ok_or(VmError::AddressConflict(u32::from(base), u32::from(size)))?;
            for region in &self.ports {
                if base < region.base + region.size && region.base < end {
                    return Err(VmError::AddressConflict(u32::from(base), u32::from(size)));
                }
            }
        }

        let index = self.devices.len();
        tracing::debug!(
            class = device.class(),
            name = device.name(),
            ?mmio,
            ?ports,
            "registering device"
        );
        self.devices.push(device);
        if let Some((base, size)) = mmio {
            self.mmio.push(MmioRegion {
                base,
                size,
                device: index,
            });
        }
        if let Some((base, size)) = ports {
            self.ports.push(PortRegion {
                base,
                size,
                device: index,
            });
        }
        Ok(index)
    }

    /// Locate the region containing an address; returns the owning device
    /// index, the offset inside the region and the region base.
    pub fn route(&self, addr: u32) -> Option<(usize, u32, u32)> {
        self.mmio
            .iter()
            .find(|r| addr >= r.base && addr - r.base < r.size)
            .map(|r| (r.device, addr - r.base, r.base))
    }

    fn route_port(&self, port: u16) -> Option<(usize, u16)> {
        self.ports
            .iter()
            .find(|r| port >= r.base && port - r.base < r.size)
            .map(|r| (r.device, port - r.base))
    }

    pub fn is_mmio(&self, addr: u32) -> bool {
        self.route(addr).is_some()
    }

    /// MMIO read if the address is routed; `None` hands the access to the
    /// memory controller.
    pub fn try_mmio_read(
        &mut self,
        ctx: &mut DeviceCtx<'_>,
        addr: u32,
        width: Width,
    ) -> Option<Result<u32, Trap>> {
        let (index, offset, base) = self.route(addr)?;
        Some(
            self.devices[index]
                .mmio_read(ctx, offset, width)
                .map_err(|t| rebase(t, base)),
        )
    }

    pub fn try_mmio_write(
        &mut self,
        ctx: &mut DeviceCtx<'_>,
        addr: u32,
        width: Width,
        value: u32,
    ) -> Option<Result<(), Trap>> {
        let (index, offset, base) = self.route(addr)?;
        Some(
            self.devices[index]
                .mmio_write(ctx, offset, width, value)
                .map_err(|t| rebase(t, base)),
        )
    }

    /// Port-space read. An unrouted port traps.
    pub fn io_read(&mut self, ctx: &mut DeviceCtx<'_>, port: u16) -> Result<u8, Trap> {
        let (index, offset) = self.route_port(port).ok_or(Trap::AccessViolation {
            addr: u32::from(port),
            access: Access::Read,
        })?;
        self.devices[index].io_read(ctx, offset)
    }

    pub fn io_write(&mut self, ctx: &mut DeviceCtx<'_>, port: u16, value: u8) -> Result<(), Trap> {
        let (index, offset) = self.route_port(port).ok_or(Trap::AccessViolation {
            addr: u32::from(port),
            access: Access::Write,
        })?;
        self.devices[index].io_write(ctx, offset, value)
    }

    /// Run every device's timed logic.
    pub fn tick_all(&mut self, ctx: &mut DeviceCtx<'_>) -> Result<(), VmError> {
        for device in &mut self.devices {
            device.tick(ctx)?;
        }
        Ok(())
    }

    pub fn devices(&self) -> &[Box<dyn Device>] {
        &self.devices
    }

    pub fn device_mut(&mut self, index: usize) -> &mut dyn Device {
        self.devices[index].as_mut()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.name() == name)
    }

    /// MMIO region of a device, if it has one.
    pub fn region_of(&self, index: usize) -> Option<(u32, u32)> {
        self.mmio
            .iter()
            .find(|r| r.device == index)
            .map(|r| (r.base, r.size))
    }
}

/// Device handlers report faults with region-relative offsets; rebase them
/// so the guest sees the absolute address.
fn rebase(trap: Trap, base: u32) -> Trap {
    match trap {
        Trap::AccessViolation { addr, access } => Trap::AccessViolation {
            addr: base + addr,
            access,
        },
        Trap::PageFault { addr, access, user } => Trap::PageFault {
            addr: base + addr,
            access,
            user,
        },
        Trap::UnalignedAccess { addr } => Trap::UnalignedAccess { addr: base + addr },
        other => other,
    }
}
