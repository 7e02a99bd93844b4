//! SVGA text display: an 80x25 two-byte-cell framebuffer plus a refresh
//! register that renders the buffer to the host.

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::bus::{Device, DeviceCtx, DeviceInfo, Width};
use crate::config::DeviceSection;
use crate::devices::OutputSink;
use crate::trap::{Access, Trap, VmError};

pub const COLUMNS: u32 = 80;
pub const ROWS: u32 = 25;
/// Two bytes per cell: character and attribute.
pub const FB_SIZE: u32 = COLUMNS * ROWS * 2;

pub const REG_REFRESH: u32 = 0x1000;
pub const MMIO_SIZE: u32 = REG_REFRESH + 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SvgaState {
    fb: Vec<u8>,
}

impl Default for SvgaState {
    fn default() -> Self {
        SvgaState {
            fb: vec![0; FB_SIZE as usize],
        }
    }
}

#[derive(Debug)]
pub struct Svga {
    name: String,
    state: SvgaState,
    sink: OutputSink,
}

impl Svga {
    pub fn from_config(section: &DeviceSection) -> Self {
        Svga {
            name: section.name.clone(),
            state: SvgaState::default(),
            sink: OutputSink::Stdout,
        }
    }

    pub fn set_sink(&mut self, sink: OutputSink) {
        self.sink = sink;
    }

    fn render(&mut self) {
        let mut out = Vec::with_capacity(((COLUMNS + 1) * ROWS) as usize);
        for row in 0..ROWS {
            for col in 0..COLUMNS {
                let cell = ((row * COLUMNS + col) * 2) as usize;
                let ch = self.state.fb[cell];
                out.push(if ch.is_ascii_graphic() || ch == b' ' {
                    ch
                } else {
                    b' '
                });
            }
            out.push(b'\n');
        }
        self.sink.write_all(&out);
    }
}

impl Device for Svga {
    fn class(&self) -> &'static str {
        "svga"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "svga".into(),
            ident: "ducky.display.svga".into(),
            flags: 0,
        }
    }

    fn mmio_read(
        &mut self,
        _ctx: &mut DeviceCtx<'_>,
        offset: u32,
        width: Width,
    ) -> Result<u32, Trap> {
        if offset == REG_REFRESH {
            return Ok(0);
        }
        if offset + width.bytes() > FB_SIZE {
            return Err(Trap::AccessViolation {
                addr: offset,
                access: Access::Read,
            });
        }
        let mut value = 0u32;
        for i in 0..width.bytes() {
            value |= u32::from(self.state.fb[(offset + i) as usize]) << (8 * i);
        }
        Ok(value)
    }

    fn mmio_write(
        &mut self,
        _ctx: &mut DeviceCtx<'_>,
        offset: u32,
        width: Width,
        value: u32,
    ) -> Result<(), Trap> {
        if offset == REG_REFRESH {
            self.render();
            return Ok(());
        }
        if offset + width.bytes() > FB_SIZE {
            return Err(Trap::AccessViolation {
                addr: offset,
                access: Access::Write,
            });
        }
        for i in 0..width.bytes() {
            self.state.fb[(offset + i) as usize] = ((value >> (8 * i)) & 0xff) as u8;
        }
        Ok(())
    }

    fn save_state(&self) -> Vec<u8> {
        bincode::serialize(&self.state).unwrap_or_default()
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.state = bincode::deserialize(bytes)
            .map_err(|e| VmError::Invariant(format!("svga snapshot: {e}")))?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
