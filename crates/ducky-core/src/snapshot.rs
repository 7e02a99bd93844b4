//! Snapshot image: the observable machine state serialized to disk.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cpu::Core;
use crate::interrupt::InterruptController;
use crate::mem::MemoryController;
use crate::trap::VmError;

/// Serialized state of one device, matched back by instance name on
/// restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub class: String,
    pub name: String,
    pub data: Vec<u8>,
}

/// Full machine state at an instruction boundary.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotImage {
    pub cores: Vec<Core>,
    pub mem: MemoryController,
    pub intc: InterruptController,
    pub clock: u64,
    pub instructions: u64,
    pub devices: Vec<DeviceState>,
}

fn snapshot_err(err: impl std::fmt::Display) -> VmError {
    VmError::Invariant(format!("snapshot: {err}"))
}

impl SnapshotImage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, VmError> {
        bincode::serialize(self).map_err(snapshot_err)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VmError> {
        bincode::deserialize(bytes).map_err(snapshot_err)
    }

    pub fn write_file(&self, path: &Path) -> Result<(), VmError> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn read_file(path: &Path) -> Result<Self, VmError> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}
