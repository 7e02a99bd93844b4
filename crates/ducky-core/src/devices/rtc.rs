//! Real-time clock device.
//!
//! Time registers mirror the host clock; the frequency register arms a
//! periodic timer IRQ measured in virtual-clock units.

use std::any::Any;

use chrono::{Datelike, Local, Timelike};
use serde::{Deserialize, Serialize};

use crate::bus::{Device, DeviceCtx, DeviceInfo, Width};
use crate::config::DeviceSection;
use crate::trap::{Access, Trap, VmError};

pub const MMIO_SIZE: u32 = 0x20;

pub const REG_SECONDS: u32 = 0x00;
pub const REG_MINUTES: u32 = 0x04;
pub const REG_HOURS: u32 = 0x08;
pub const REG_DAY: u32 = 0x0c;
pub const REG_MONTH: u32 = 0x10;
pub const REG_YEAR: u32 = 0x14;
pub const REG_FREQUENCY: u32 = 0x18;

/// Virtual-clock units per guest second: one unit per executed instruction.
pub const CLOCK_HZ: u64 = 1_000_000;

pub const DEFAULT_IRQ: u32 = 8;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RtcState {
    frequency: u32,
    deadline: Option<u64>,
}

#[derive(Debug)]
pub struct Rtc {
    name: String,
    irq: u32,
    state: RtcState,
}

impl Rtc {
    pub fn from_config(section: &DeviceSection) -> Self {
        let mut rtc = Rtc {
            name: section.name.clone(),
            irq: section.irq.unwrap_or(DEFAULT_IRQ),
            state: RtcState::default(),
        };
        if let Some(freq) = section.int_key("frequency") {
            rtc.state.frequency = freq as u32;
            rtc.rearm(0);
        }
        rtc
    }

    fn period(&self) -> Option<u64> {
        if self.state.frequency == 0 {
            return None;
        }
        Some((CLOCK_HZ / u64::from(self.state.frequency)).max(1))
    }

    fn rearm(&mut self, clock: u64) {
        self.state.deadline = self.period().map(|p| clock + p);
    }
}

impl Device for Rtc {
    fn class(&self) -> &'static str {
        "rtc"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "rtc".into(),
            ident: "ducky.rtc".into(),
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
        let now = Local::now();
        match offset {
            REG_SECONDS => Ok(now.second()),
            REG_MINUTES => Ok(now.minute()),
            REG_HOURS => Ok(now.hour()),
            REG_DAY => Ok(now.day()),
            REG_MONTH => Ok(now.month()),
            REG_YEAR => Ok(now.year() as u32),
            REG_FREQUENCY => Ok(self.state.frequency),
            _ => Err(Trap::AccessViolation {
                addr: offset,
                access: Access::Read,
            }),
        }
    }

    fn mmio_write(
        &mut self,
        ctx: &mut DeviceCtx<'_>,
        offset: u32,
        _width: Width,
        value: u32,
    ) -> Result<(), Trap> {
        match offset {
            REG_FREQUENCY => {
                self.state.frequency = value;
                self.rearm(ctx.clock);
                Ok(())
            }
            _ => Err(Trap::AccessViolation {
                addr: offset,
                access: Access::Write,
            }),
        }
    }

    fn tick(&mut self, ctx: &mut DeviceCtx<'_>) -> Result<(), VmError> {
        if let Some(deadline) = self.state.deadline {
            if ctx.clock >= deadline {
                ctx.intc.raise(self.irq);
                self.rearm(ctx.clock);
            }
        }
        Ok(())
    }

    fn save_state(&self) -> Vec<u8> {
        bincode::serialize(&self.state).unwrap_or_default()
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.state = bincode::deserialize(bytes)
            .map_err(|e| VmError::Invariant(format!("rtc snapshot: {e}")))?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
