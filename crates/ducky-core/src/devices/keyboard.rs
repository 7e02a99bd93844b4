//! Keyboard device: a scancode queue fed by a host input source.
//!
//! The status/data register pair follows the usual poll-then-drain shape; a
//! non-empty queue keeps the IRQ asserted once per scheduler round until the
//! guest drains it.

use std::any::Any;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::bus::{Device, DeviceCtx, DeviceInfo, Width};
use crate::config::DeviceSection;
use crate::devices::InputSource;
use crate::trap::{Access, Trap, VmError};

pub const MMIO_SIZE: u32 = 0x8;

pub const REG_STATUS: u32 = 0x00;
pub const REG_DATA: u32 = 0x04;

pub const DEFAULT_IRQ: u32 = 9;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct KeyboardState {
    queue: VecDeque<u8>,
    /// The IRQ was raised for the bytes currently queued. Cleared when the
    /// guest drains the queue, so delivery is one interrupt per burst rather
    /// than a storm while the ISR runs.
    signalled: bool,
}

#[derive(Debug)]
pub struct Keyboard {
    name: String,
    irq: u32,
    state: KeyboardState,
    source: InputSource,
}

impl Keyboard {
    pub fn from_config(section: &DeviceSection) -> Self {
        Keyboard {
            name: section.name.clone(),
            irq: section.irq.unwrap_or(DEFAULT_IRQ),
            state: KeyboardState::default(),
            source: InputSource::Null,
        }
    }

    /// Replace the host-facing input source; terminal wiring uses this.
    pub fn set_source(&mut self, source: InputSource) {
        self.source = source;
    }

    /// Enqueue one scancode from the host side.
    pub fn inject(&mut self, byte: u8) {
        self.state.queue.push_back(byte);
    }
}

impl Device for Keyboard {
    fn class(&self) -> &'static str {
        "keyboard"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "kbd".into(),
            ident: "ducky.input.keyboard".into(),
            flags: 0,
        }
    }

    fn irq(&self) -> Option<u32> {
        Some(self.irq)
    }

    fn mmio_read(
        &mut self,
        _ctx: &mut DeviceCtx<'_>,
        offset: u32,
        _width: Width,
    ) -> Result<u32, Trap> {
        match offset {
            REG_STATUS => Ok(u32::from(!self.state.queue.is_empty())),
            // Reads drain one byte.
            REG_DATA => Ok(u32::from(self.state.queue.pop_front().unwrap_or(0))),
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
        Err(Trap::AccessViolation {
            addr: offset,
            access: Access::Write,
        })
    }

    fn tick(&mut self, ctx: &mut DeviceCtx<'_>) -> Result<(), VmError> {
        self.source.poll(&mut self.state.queue);
        if self.state.queue.is_empty() {
            self.state.signalled = false;
        } else if !self.state.signalled {
            ctx.intc.raise(self.irq);
            self.state.signalled = true;
        }
        Ok(())
    }

    fn save_state(&self) -> Vec<u8> {
        bincode::serialize(&self.state).unwrap_or_default()
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.state = bincode::deserialize(bytes)
            .map_err(|e| VmError::Invariant(format!("keyboard snapshot: {e}")))?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
