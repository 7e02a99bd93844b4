//! TTY output device: a single data register forwarding bytes to a sink.

use std::any::Any;

use crate::bus::{Device, DeviceCtx, DeviceInfo, Width};
use crate::config::DeviceSection;
use crate::devices::OutputSink;
use crate::trap::{Access, Trap};

pub const MMIO_SIZE: u32 = 0x4;

pub const REG_DATA: u32 = 0x00;

#[derive(Debug)]
pub struct Tty {
    name: String,
    sink: OutputSink,
}

impl Tty {
    pub fn from_config(section: &DeviceSection) -> Self {
        Tty {
            name: section.name.clone(),
            sink: OutputSink::Null,
        }
    }

    /// Replace the host-facing output sink; terminal wiring uses this.
    pub fn set_sink(&mut self, sink: OutputSink) {
        self.sink = sink;
    }
}

impl Device for Tty {
    fn class(&self) -> &'static str {
        "tty"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "tty".into(),
            ident: "ducky.output.tty".into(),
            flags: 0,
        }
    }

    fn mmio_read(
        &mut self,
        _ctx: &mut DeviceCtx<'_>,
        offset: u32,
        _width: Width,
    ) -> Result<u32, Trap> {
        Err(Trap::AccessViolation {
            addr: offset,
            access: Access::Read,
        })
    }

    fn mmio_write(
        &mut self,
        _ctx: &mut DeviceCtx<'_>,
        offset: u32,
        _width: Width,
        value: u32,
    ) -> Result<(), Trap> {
        match offset {
            REG_DATA => {
                self.sink.write_byte(value as u8);
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
