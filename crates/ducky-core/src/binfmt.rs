//! Object/executable binary format consumed by the boot loader.
//!
//! Layout: a fixed header `{magic, flags: u16, section_count: u16}`,
//! `section_count` section records `{name: [u8;16], type: u8, flags: u8,
//! base: u32, items: u32, data_size: u32}`, then the section payloads
//! concatenated in record order.

use std::path::Path;

use crate::mem::{MemoryController, PageFlags};
use crate::trap::VmError;

/// "DKOB", little-endian.
pub const BINARY_MAGIC: u32 = 0x424f_4b44;

pub const SECTION_NAME_LEN: usize = 16;
const SECTION_RECORD_LEN: usize = SECTION_NAME_LEN + 1 + 1 + 4 + 4 + 4;

pub const FLAG_READABLE: u8 = 1 << 0;
pub const FLAG_WRITABLE: u8 = 1 << 1;
pub const FLAG_EXECUTABLE: u8 = 1 << 2;
pub const FLAG_LOADABLE: u8 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionType {
    Text,
    Data,
    Bss,
    Symbols,
    Reloc,
    Strings,
}

impl SectionType {
    pub fn code(self) -> u8 {
        match self {
            SectionType::Text => 0,
            SectionType::Data => 1,
            SectionType::Bss => 2,
            SectionType::Symbols => 3,
            SectionType::Reloc => 4,
            SectionType::Strings => 5,
        }
    }

    fn from_code(code: u8) -> Result<Self, VmError> {
        Ok(match code {
            0 => SectionType::Text,
            1 => SectionType::Data,
            2 => SectionType::Bss,
            3 => SectionType::Symbols,
            4 => SectionType::Reloc,
            5 => SectionType::Strings,
            other => {
                return Err(VmError::BinaryFormat(format!(
                    "unknown section type {other}"
                )))
            }
        })
    }
}

/// Relocation kinds. The engine only validates them, applying relocations is
/// the linker's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    AbsoluteWord,
    PcRelBranch,
    SymbolLow,
    SymbolHigh,
}

impl RelocKind {
    fn from_code(code: u8) -> Result<Self, VmError> {
        Ok(match code {
            0 => RelocKind::AbsoluteWord,
            1 => RelocKind::PcRelBranch,
            2 => RelocKind::SymbolLow,
            3 => RelocKind::SymbolHigh,
            other => {
                return Err(VmError::BinaryFormat(format!(
                    "unknown relocation kind {other}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub stype: SectionType,
    pub flags: u8,
    pub base: u32,
    /// Record count for SYMBOLS/RELOC, byte length for BSS.
    pub items: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Binary {
    pub flags: u16,
    pub sections: Vec<Section>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], VmError> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(VmError::BinaryFormat("binary truncated".into())),
        }
    }

    fn u8(&mut self) -> Result<u8, VmError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, VmError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, VmError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl Binary {
    pub fn parse(bytes: &[u8]) -> Result<Binary, VmError> {
        let mut reader = Reader { bytes, pos: 0 };
        let magic = reader.u32()?;
        if magic != BINARY_MAGIC {
            return Err(VmError::BinaryFormat(format!(
                "bad binary magic {magic:#010x}"
            )));
        }
        let flags = reader.u16()?;
        let section_count = reader.u16()?;

        struct RawSection {
            name: String,
            stype: SectionType,
            flags: u8,
            base: u32,
            items: u32,
            data_size: u32,
        }

        let mut raw = Vec::with_capacity(usize::from(section_count));
        for _ in 0..section_count {
            let name_bytes = reader.take(SECTION_NAME_LEN)?;
            let end = name_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(SECTION_NAME_LEN);
            let name = String::from_utf8(name_bytes[..end].to_vec())
                .map_err(|_| VmError::BinaryFormat("section name not utf-8".into()))?;
            let stype = SectionType::from_code(reader.u8()?)?;
            let flags = reader.u8()?;
            let base = reader.u32()?;
            let items = reader.u32()?;
            let data_size = reader.u32()?;
            raw.push(RawSection {
                name,
                stype,
                flags,
                base,
                items,
                data_size,
            });
        }

        let mut sections = Vec::with_capacity(raw.len());
        for section in raw {
            let data = reader.take(section.data_size as usize)?.to_vec();
            sections.push(Section {
                name: section.name,
                stype: section.stype,
                flags: section.flags,
                base: section.base,
                items: section.items,
                data,
            });
        }

        let binary = Binary { flags, sections };
        binary.validate()?;
        Ok(binary)
    }

    fn validate(&self) -> Result<(), VmError> {
        for section in &self.sections {
            match section.stype {
                SectionType::Bss if !section.data.is_empty() => {
                    return Err(VmError::BinaryFormat(format!(
                        "bss section {} carries payload",
                        section.name
                    )));
                }
                SectionType::Symbols => {
                    if section.data.len() != section.items as usize * 8 {
                        return Err(VmError::BinaryFormat(format!(
                            "symbol section {} size mismatch",
                            section.name
                        )));
                    }
                }
                SectionType::Reloc => {
                    if section.data.len() != section.items as usize * 12 {
                        return Err(VmError::BinaryFormat(format!(
                            "reloc section {} size mismatch",
                            section.name
                        )));
                    }
                    for record in section.data.chunks_exact(12) {
                        RelocKind::from_code(record[0])?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&BINARY_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&(self.sections.len() as u16).to_le_bytes());
        for section in &self.sections {
            let mut name = [0u8; SECTION_NAME_LEN];
            let take = section.name.len().min(SECTION_NAME_LEN);
            name[..take].copy_from_slice(&section.name.as_bytes()[..take]);
            out.extend_from_slice(&name);
            out.push(section.stype.code());
            out.push(section.flags);
            out.extend_from_slice(&section.base.to_le_bytes());
            out.extend_from_slice(&section.items.to_le_bytes());
            out.extend_from_slice(&(section.data.len() as u32).to_le_bytes());
        }
        for section in &self.sections {
            out.extend_from_slice(&section.data);
        }
        out
    }

    pub fn read_file(path: &Path) -> Result<Binary, VmError> {
        let bytes = std::fs::read(path)?;
        Binary::parse(&bytes).map_err(|e| match e {
            VmError::BinaryFormat(msg) => {
                VmError::BinaryFormat(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Symbol table: name -> address, resolved through the STRINGS section.
    pub fn symbols(&self) -> Result<Vec<(String, u32)>, VmError> {
        let strings = self
            .sections
            .iter()
            .find(|s| s.stype == SectionType::Strings)
            .map(|s| s.data.as_slice())
            .unwrap_or(&[]);
        let mut symbols = Vec::new();
        for section in &self.sections {
            if section.stype != SectionType::Symbols {
                continue;
            }
            for record in section.data.chunks_exact(8) {
                let name_off =
                    u32::from_le_bytes([record[0], record[1], record[2], record[3]]) as usize;
                let addr = u32::from_le_bytes([record[4], record[5], record[6], record[7]]);
                let tail = strings.get(name_off..).ok_or_else(|| {
                    VmError::BinaryFormat(format!("symbol name offset {name_off} out of range"))
                })?;
                let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
                let name = String::from_utf8(tail[..end].to_vec())
                    .map_err(|_| VmError::BinaryFormat("symbol name not utf-8".into()))?;
                symbols.push((name, addr));
            }
        }
        Ok(symbols)
    }

    /// Entry point: a named symbol when given, the base of the first TEXT
    /// section otherwise.
    pub fn entry(&self, symbol: Option<&str>) -> Result<u32, VmError> {
        match symbol {
            Some(wanted) => self
                .symbols()?
                .into_iter()
                .find(|(name, _)| name == wanted)
                .map(|(_, addr)| addr)
                .ok_or_else(|| {
                    VmError::BinaryFormat(format!("entry symbol {wanted:?} not found"))
                }),
            None => self
                .sections
                .iter()
                .find(|s| s.stype == SectionType::Text)
                .map(|s| s.base)
                .ok_or_else(|| VmError::BinaryFormat("no text section".into())),
        }
    }

    /// Load the image: TEXT maps read-execute, DATA read-write, BSS is
    /// zero-filled read-write. Symbol, relocation and string sections stay
    /// host-side.
    pub fn load(&self, mem: &mut MemoryController) -> Result<(), VmError> {
        for section in &self.sections {
            match section.stype {
                SectionType::Text => {
                    mem.alloc_region(section.base, section.data.len() as u32, PageFlags::rx(), None)?;
                    mem.host_write(section.base, &section.data)?;
                }
                SectionType::Data => {
                    mem.alloc_region(section.base, section.data.len() as u32, PageFlags::rw(), None)?;
                    mem.host_write(section.base, &section.data)?;
                }
                SectionType::Bss => {
                    // Pages come up zeroed, allocation is the whole job.
                    mem.alloc_region(section.base, section.items, PageFlags::rw(), None)?;
                }
                SectionType::Symbols | SectionType::Reloc | SectionType::Strings => {}
            }
            tracing::debug!(
                name = %section.name,
                ?section.stype,
                base = format_args!("{:#010x}", section.base),
                size = section.data.len(),
                "section processed"
            );
        }
        Ok(())
    }
}

/// Build a symbol + strings section pair from `(name, addr)` entries.
pub fn build_symbol_sections(symbols: &[(&str, u32)]) -> (Section, Section) {
    let mut strings = Vec::new();
    let mut records = Vec::new();
    for (name, addr) in symbols {
        let offset = strings.len() as u32;
        strings.extend_from_slice(name.as_bytes());
        strings.push(0);
        records.extend_from_slice(&offset.to_le_bytes());
        records.extend_from_slice(&addr.to_le_bytes());
    }
    (
        Section {
            name: ".symtab".into(),
            stype: SectionType::Symbols,
            flags: 0,
            base: 0,
            items: symbols.len() as u32,
            data: records,
        },
        Section {
            name: ".strtab".into(),
            stype: SectionType::Strings,
            flags: 0,
            base: 0,
            items: 0,
            data: strings,
        },
    )
}
