//! Block I/O device: 512-byte blocks against a host backing file, with DMA
//! into guest memory and a completion IRQ after a configurable latency.

use std::any::Any;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bus::{Device, DeviceCtx, DeviceInfo, Width};
use crate::config::DeviceSection;
use crate::trap::{Access, Trap, VmError};

pub const MMIO_SIZE: u32 = 0x14;

pub const REG_COMMAND: u32 = 0x00;
pub const REG_STATUS: u32 = 0x04;
pub const REG_BLOCK: u32 = 0x08;
pub const REG_ADDRESS: u32 = 0x0c;
pub const REG_COUNT: u32 = 0x10;

pub const CMD_READ: u32 = 1;
pub const CMD_WRITE: u32 = 2;

pub const STATUS_IDLE: u32 = 0;
pub const STATUS_BUSY: u32 = 1;
pub const STATUS_DONE: u32 = 2;
pub const STATUS_ERROR: u32 = 3;

pub const BLOCK_SIZE: u32 = 512;

pub const DEFAULT_IRQ: u32 = 10;
const DEFAULT_LATENCY: u64 = 32;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct BlockDeviceState {
    command: u32,
    status: u32,
    block: u32,
    address: u32,
    count: u32,
    deadline: Option<u64>,
}

#[derive(Debug)]
pub struct BlockDevice {
    name: String,
    irq: u32,
    path: PathBuf,
    file: File,
    latency: u64,
    state: BlockDeviceState,
}

impl BlockDevice {
    pub fn from_config(section: &DeviceSection) -> Result<Self, VmError> {
        let path = PathBuf::from(section.str_key("filepath").ok_or_else(|| {
            VmError::Configuration(format!("device {} needs filepath", section.name))
        })?);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| VmError::DeviceInit(format!("{}: {e}", path.display())))?;
        Ok(BlockDevice {
            name: section.name.clone(),
            irq: section.irq.unwrap_or(DEFAULT_IRQ),
            path,
            file,
            latency: section
                .int_key("latency")
                .map(|l| l as u64)
                .unwrap_or(DEFAULT_LATENCY),
            state: BlockDeviceState::default(),
        })
    }

    fn transfer(&mut self, ctx: &mut DeviceCtx<'_>) -> std::io::Result<()> {
        let len = (self.state.count.max(1) * BLOCK_SIZE) as usize;
        let offset = u64::from(self.state.block) * u64::from(BLOCK_SIZE);
        match self.state.command {
            CMD_READ => {
                self.file.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; len];
                // Short reads past the end of the backing file stay zero.
                let mut filled = 0;
                while filled < len {
                    let n = self.file.read(&mut buf[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                ctx.mem
                    .host_write(self.state.address, &buf)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            }
            CMD_WRITE => {
                let mut buf = vec![0u8; len];
                ctx.mem
                    .host_read(self.state.address, &mut buf)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
                self.file.seek(SeekFrom::Start(offset))?;
                self.file.write_all(&buf)?;
                self.file.flush()
            }
            _ => Ok(()),
        }
    }

    fn complete(&mut self, ctx: &mut DeviceCtx<'_>) {
        self.state.deadline = None;
        match self.transfer(ctx) {
            Ok(()) => self.state.status = STATUS_DONE,
            Err(err) => {
                tracing::warn!(device = %self.name, path = %self.path.display(), %err,
                    "block transfer failed, retrying");
                match self.transfer(ctx) {
                    Ok(()) => self.state.status = STATUS_DONE,
                    Err(err) => {
                        tracing::error!(device = %self.name, %err, "block transfer failed");
                        self.state.status = STATUS_ERROR;
                    }
                }
            }
        }
        ctx.intc.raise(self.irq);
    }
}

impl Device for BlockDevice {
    fn class(&self) -> &'static str {
        "block"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "block".into(),
            ident: "ducky.storage.block".into(),
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
            REG_COMMAND => Ok(self.state.command),
            REG_STATUS => {
                let status = self.state.status;
                // Completion is acknowledged by reading it.
                if status == STATUS_DONE || status == STATUS_ERROR {
                    self.state.status = STATUS_IDLE;
                }
                Ok(status)
            }
            REG_BLOCK => Ok(self.state.block),
            REG_ADDRESS => Ok(self.state.address),
            REG_COUNT => Ok(self.state.count),
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
            REG_COMMAND => {
                if self.state.status == STATUS_BUSY {
                    tracing::warn!(device = %self.name, "command while busy ignored");
                    return Ok(());
                }
                if value != CMD_READ && value != CMD_WRITE {
                    self.state.status = STATUS_ERROR;
                    return Ok(());
                }
                self.state.command = value;
                self.state.status = STATUS_BUSY;
                let blocks = u64::from(self.state.count.max(1));
                self.state.deadline = Some(ctx.clock + self.latency * blocks);
                Ok(())
            }
            REG_BLOCK => {
                self.state.block = value;
                Ok(())
            }
            REG_ADDRESS => {
                self.state.address = value;
                Ok(())
            }
            REG_COUNT => {
                self.state.count = value;
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
                self.complete(ctx);
            }
        }
        Ok(())
    }

    fn save_state(&self) -> Vec<u8> {
        bincode::serialize(&self.state).unwrap_or_default()
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.state = bincode::deserialize(bytes)
            .map_err(|e| VmError::Invariant(format!("block snapshot: {e}")))?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
