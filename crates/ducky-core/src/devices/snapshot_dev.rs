//! Snapshot trigger device. A write to the trigger register requests a
//! snapshot; the machine takes it at the next instruction boundary, never
//! mid-instruction.

use std::any::Any;
use std::path::PathBuf;

use crate::bus::{Device, DeviceCtx, DeviceInfo, Width};
use crate::config::DeviceSection;
use crate::trap::{Access, Trap, VmError};

pub const MMIO_SIZE: u32 = 0x4;

pub const REG_TRIGGER: u32 = 0x00;

#[derive(Debug)]
pub struct SnapshotDevice {
    name: String,
    path: PathBuf,
    requested: bool,
}

impl SnapshotDevice {
    pub fn from_config(section: &DeviceSection) -> Result<Self, VmError> {
        let path = PathBuf::from(section.str_key("filepath").ok_or_else(|| {
            VmError::Configuration(format!("device {} needs filepath", section.name))
        })?);
        Ok(SnapshotDevice {
            name: section.name.clone(),
            path,
            requested: false,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Consume a pending request, if any. Polled by the machine between
    /// instructions.
    pub fn take_request(&mut self) -> bool {
        std::mem::take(&mut self.requested)
    }
}

impl Device for SnapshotDevice {
    fn class(&self) -> &'static str {
        "snapshot"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "snapshot".into(),
            ident: "ducky.snapshot".into(),
            flags: 0,
        }
    }

    fn mmio_read(
        &mut self,
        _ctx: &mut DeviceCtx<'_>,
        offset: u32,
        _width: Width,
    ) -> Result<u32, Trap> {
        match offset {
            REG_TRIGGER => Ok(u32::from(self.requested)),
            _ => Err(Trap::AccessViolation {
                addr: offset,
                access: Access::Read,
            }),
        }
    }

    fn mmio_write(
        &mut self,
        _ctx: &mut DeviceCtx<'_>,
        offset: u32,
        _width: Width,
        _value: u32,
    ) -> Result<(), Trap> {
        match offset {
            REG_TRIGGER => {
                self.requested = true;
                Ok(())
            }
            _ => Err(Trap::AccessViolation {
                addr: offset,
                access: Access::Write,
            }),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
