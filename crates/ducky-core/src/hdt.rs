//! Hardware Description Table.
//!
//! A tagged-record blob placed in guest-visible memory during boot; guests
//! find it through r0. Records are 4-byte-aligned `{type: u16, length: u16}`
//! headers with type-specific payloads; the blob starts with
//! `{magic, entry count, total length}`.

use crate::bus::DeviceInfo;
use crate::trap::VmError;

/// "DUCK", little-endian.
pub const HDT_MAGIC: u32 = 0x4b43_5544;

pub const ENTRY_CPU: u16 = 0;
pub const ENTRY_MEMORY: u16 = 1;
pub const ENTRY_ARGUMENT: u16 = 2;
pub const ENTRY_DEVICE: u16 = 3;

pub const HEADER_SIZE: u32 = 12;

const DEVICE_NAME_LEN: usize = 10;
const DEVICE_IDENT_LEN: usize = 32;
const ARGUMENT_FIELD_LEN: usize = 16;

/// IRQ value meaning "none".
pub const IRQ_NONE: u32 = 0xffff_ffff;

/// One parsed HDT record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HdtEntry {
    Cpu {
        cpus: u16,
        cores: u16,
    },
    Memory {
        size: u32,
    },
    Argument {
        name: String,
        value: String,
    },
    Device {
        name: String,
        flags: u16,
        ident: String,
        mmio_base: u32,
        mmio_size: u32,
        irq: Option<u32>,
    },
}

/// Builds the boot-time HDT blob.
#[derive(Debug, Default)]
pub struct HdtBuilder {
    entries: Vec<Vec<u8>>,
}

fn push_fixed(buf: &mut Vec<u8>, text: &str, len: usize) {
    let bytes = text.as_bytes();
    let take = bytes.len().min(len);
    buf.extend_from_slice(&bytes[..take]);
    buf.resize(buf.len() + (len - take), 0);
}

fn record(kind: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    let length = (4 + payload.len()).next_multiple_of(4) as u16;
    buf.extend_from_slice(&kind.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(payload);
    buf.resize(length as usize, 0);
    buf
}

impl HdtBuilder {
    pub fn new() -> Self {
        HdtBuilder::default()
    }

    pub fn cpu(&mut self, cpus: u16, cores: u16) -> &mut Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&cpus.to_le_bytes());
        payload.extend_from_slice(&cores.to_le_bytes());
        self.entries.push(record(ENTRY_CPU, &payload));
        self
    }

    pub fn memory(&mut self, size: u32) -> &mut Self {
        self.entries.push(record(ENTRY_MEMORY, &size.to_le_bytes()));
        self
    }

    pub fn argument(&mut self, name: &str, value: &str) -> &mut Self {
        let mut payload = Vec::new();
        push_fixed(&mut payload, name, ARGUMENT_FIELD_LEN);
        push_fixed(&mut payload, value, ARGUMENT_FIELD_LEN);
        self.entries.push(record(ENTRY_ARGUMENT, &payload));
        self
    }

    pub fn device(
        &mut self,
        info: &DeviceInfo,
        mmio: Option<(u32, u32)>,
        irq: Option<u32>,
    ) -> &mut Self {
        let (mmio_base, mmio_size) = mmio.unwrap_or((0, 0));
        let mut payload = Vec::new();
        push_fixed(&mut payload, &info.name, DEVICE_NAME_LEN);
        payload.extend_from_slice(&info.flags.to_le_bytes());
        push_fixed(&mut payload, &info.ident, DEVICE_IDENT_LEN);
        payload.extend_from_slice(&mmio_base.to_le_bytes());
        payload.extend_from_slice(&mmio_size.to_le_bytes());
        payload.extend_from_slice(&irq.unwrap_or(IRQ_NONE).to_le_bytes());
        self.entries.push(record(ENTRY_DEVICE, &payload));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let total: usize = HEADER_SIZE as usize + self.entries.iter().map(Vec::len).sum::<usize>();
        let mut blob = Vec::with_capacity(total);
        blob.extend_from_slice(&HDT_MAGIC.to_le_bytes());
        blob.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        blob.extend_from_slice(&(total as u32).to_le_bytes());
        for entry in &self.entries {
            blob.extend_from_slice(entry);
        }
        blob
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], VmError> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(VmError::BinaryFormat("hdt truncated".into())),
        }
    }

    fn u16(&mut self) -> Result<u16, VmError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, VmError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn fixed_str(&mut self, len: usize) -> Result<String, VmError> {
        let bytes = self.take(len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(len);
        String::from_utf8(bytes[..end].to_vec())
            .map_err(|_| VmError::BinaryFormat("hdt string not utf-8".into()))
    }
}

/// Parse an HDT blob, checking the header invariants: magic constant, entry
/// count matching the records, total length matching the byte count.
pub fn parse(bytes: &[u8]) -> Result<Vec<HdtEntry>, VmError> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let magic = cursor.u32()?;
    if magic != HDT_MAGIC {
        return Err(VmError::BinaryFormat(format!(
            "bad hdt magic {magic:#010x}"
        )));
    }
    let count = cursor.u32()?;
    let total = cursor.u32()? as usize;
    if total > bytes.len() {
        return Err(VmError::BinaryFormat("hdt length beyond blob".into()));
    }

    let mut entries = Vec::new();
    for _ in 0..count {
        let kind = cursor.u16()?;
        let length = cursor.u16()? as usize;
        if length < 4 {
            return Err(VmError::BinaryFormat("hdt record too short".into()));
        }
        let payload_len = length - 4;
        let mut payload = Cursor {
            bytes: cursor.take(payload_len)?,
            pos: 0,
        };
        let entry = match kind {
            ENTRY_CPU => HdtEntry::Cpu {
                cpus: payload.u16()?,
                cores: payload.u16()?,
            },
            ENTRY_MEMORY => HdtEntry::Memory {
                size: payload.u32()?,
            },
            ENTRY_ARGUMENT => HdtEntry::Argument {
                name: payload.fixed_str(ARGUMENT_FIELD_LEN)?,
                value: payload.fixed_str(ARGUMENT_FIELD_LEN)?,
            },
            ENTRY_DEVICE => {
                let name = payload.fixed_str(DEVICE_NAME_LEN)?;
                let flags = payload.u16()?;
                let ident = payload.fixed_str(DEVICE_IDENT_LEN)?;
                let mmio_base = payload.u32()?;
                let mmio_size = payload.u32()?;
                let irq = payload.u32()?;
                HdtEntry::Device {
                    name,
                    flags,
                    ident,
                    mmio_base,
                    mmio_size,
                    irq: (irq != IRQ_NONE).then_some(irq),
                }
            }
            other => {
                return Err(VmError::BinaryFormat(format!(
                    "unknown hdt record type {other}"
                )))
            }
        };
        entries.push(entry);
    }

    if cursor.pos != total {
        return Err(VmError::BinaryFormat(format!(
            "hdt length mismatch: header {total}, records end at {}",
            cursor.pos
        )));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_parse_round_trip() {
        let mut builder = HdtBuilder::new();
        builder
            .cpu(1, 2)
            .memory(0x10000)
            .argument("console", "tty0")
            .device(
                &DeviceInfo {
                    name: "kbd".into(),
                    ident: "ducky.input.keyboard".into(),
                    flags: 0,
                },
                Some((0x9100, 0x8)),
                Some(9),
            );
        let blob = builder.build();
        let entries = parse(&blob).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0], HdtEntry::Cpu { cpus: 1, cores: 2 });
        assert_eq!(entries[1], HdtEntry::Memory { size: 0x10000 });
        assert_eq!(
            entries[2],
            HdtEntry::Argument {
                name: "console".into(),
                value: "tty0".into()
            }
        );
        match &entries[3] {
            HdtEntry::Device {
                name,
                ident,
                mmio_base,
                irq,
                ..
            } => {
                assert_eq!(name, "kbd");
                assert_eq!(ident, "ducky.input.keyboard");
                assert_eq!(*mmio_base, 0x9100);
                assert_eq!(*irq, Some(9));
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let mut blob = HdtBuilder::new().build();
        blob[0] ^= 0xff;
        assert!(parse(&blob).is_err());
    }

    #[test]
    fn truncated_blob_rejected() {
        let mut builder = HdtBuilder::new();
        builder.memory(0x1000);
        let blob = builder.build();
        assert!(parse(&blob[..blob.len() - 2]).is_err());
    }
}
