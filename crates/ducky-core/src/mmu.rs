//! Memory management unit: two-level virtual address translation with a
//! translation cache in front of the walk.
//!
//! Virtual addresses are split as `vaddr = vpn << 8 | offset`; the 24-bit
//! vpn indexes a level-1 table (high 12 bits) pointing at level-2 tables
//! (low 12 bits). Entries are words holding a page-aligned physical base in
//! the high 24 bits and flag bits below.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::mem::{CoreId, MemoryController, PAGE_SHIFT, PAGE_SIZE};
use crate::trap::{Access, Trap};

pub const PTE_PRESENT: u32 = 1 << 0;
pub const PTE_READ: u32 = 1 << 1;
pub const PTE_WRITE: u32 = 1 << 2;
pub const PTE_EXECUTE: u32 = 1 << 3;
pub const PTE_USER: u32 = 1 << 4;
pub const PTE_DIRTY: u32 = 1 << 5;

const PTE_BASE_MASK: u32 = !(PAGE_SIZE - 1);

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    phys_base: u32,
    flags: u32,
    /// Physical address of the level-2 entry, for dirty write-back.
    pte_addr: u32,
}

/// Advisory translation cache. A miss falls back to the table walk.
#[derive(Debug, Clone, Default)]
struct Tlb {
    map: BTreeMap<u32, TlbEntry>,
    capacity: usize,
}

impl Tlb {
    fn get(&self, vpn: u32) -> Option<TlbEntry> {
        self.map.get(&vpn).copied()
    }

    fn insert(&mut self, vpn: u32, entry: TlbEntry) {
        if self.capacity == 0 {
            return;
        }
        if self.map.len() >= self.capacity {
            let evict = *self.map.keys().next().unwrap();
            self.map.remove(&evict);
        }
        self.map.insert(vpn, entry);
    }

    fn update_flags(&mut self, vpn: u32, flags: u32) {
        if let Some(entry) = self.map.get_mut(&vpn) {
            entry.flags = flags;
        }
    }

    fn flush(&mut self) {
        self.map.clear();
    }
}

/// Per-core MMU state. Created disabled; the guest turns paging on with
/// `LPM` after installing a table with `LPT`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mmu {
    pub enabled: bool,
    pub table_base: u32,
    #[serde(skip)]
    tlb: Tlb,
}

impl Mmu {
    pub fn new(tlb_capacity: usize) -> Self {
        Mmu {
            enabled: false,
            table_base: 0,
            tlb: Tlb {
                map: BTreeMap::new(),
                capacity: tlb_capacity,
            },
        }
    }

    /// Install a new table base. Flushes the translation cache.
    pub fn set_table_base(&mut self, base: u32) {
        self.table_base = base;
        self.tlb.flush();
    }

    pub fn flush_tlb(&mut self) {
        self.tlb.flush();
    }

    fn check_flags(vaddr: u32, flags: u32, access: Access, user: bool) -> Result<(), Trap> {
        if user && flags & PTE_USER == 0 {
            return Err(Trap::AccessViolation {
                addr: vaddr,
                access,
            });
        }
        let permitted = match access {
            Access::Read => flags & PTE_READ != 0,
            Access::Write => flags & PTE_WRITE != 0,
            Access::Execute => flags & PTE_EXECUTE != 0,
        };
        if !permitted {
            return Err(Trap::AccessViolation {
                addr: vaddr,
                access,
            });
        }
        Ok(())
    }

    /// Translate a virtual address. When paging is disabled the address is
    /// passed through untouched.
    pub fn translate(
        &mut self,
        mem: &mut MemoryController,
        vaddr: u32,
        access: Access,
        user: bool,
        _core: CoreId,
    ) -> Result<u32, Trap> {
        if !self.enabled {
            return Ok(vaddr);
        }

        let vpn = vaddr >> PAGE_SHIFT;
        let offset = vaddr & (PAGE_SIZE - 1);
        let fault = Trap::PageFault {
            addr: vaddr,
            access,
            user,
        };

        if let Some(entry) = self.tlb.get(vpn) {
            Self::check_flags(vaddr, entry.flags, access, user)?;
            if access == Access::Write && entry.flags & PTE_DIRTY == 0 {
                let dirty = entry.flags | PTE_DIRTY;
                mem.host_write_u32(entry.pte_addr, entry.phys_base | dirty)
                    .map_err(|_| fault.clone())?;
                self.tlb.update_flags(vpn, dirty);
            }
            return Ok(entry.phys_base | offset);
        }

        // Level 1: high 12 bits of the vpn.
        let l1_addr = self.table_base.wrapping_add((vpn >> 12) * 4);
        let l1 = mem.read_u32(l1_addr, None).map_err(|_| fault.clone())?;
        if l1 & PTE_PRESENT == 0 {
            return Err(fault);
        }

        // Level 2: low 12 bits of the vpn.
        let l2_addr = (l1 & PTE_BASE_MASK).wrapping_add((vpn & 0xfff) * 4);
        let pte = mem.read_u32(l2_addr, None).map_err(|_| fault.clone())?;
        if pte & PTE_PRESENT == 0 {
            return Err(fault);
        }

        let mut flags = pte & (PAGE_SIZE - 1);
        Self::check_flags(vaddr, flags, access, user)?;

        let phys_base = pte & PTE_BASE_MASK;
        if access == Access::Write && flags & PTE_DIRTY == 0 {
            flags |= PTE_DIRTY;
            mem.host_write_u32(l2_addr, phys_base | flags)
                .map_err(|_| fault.clone())?;
        }

        self.tlb.insert(
            vpn,
            TlbEntry {
                phys_base,
                flags,
                pte_addr: l2_addr,
            },
        );
        Ok(phys_base | offset)
    }
}

/// Build a level-2 entry word.
pub fn pte(phys_base: u32, flags: u32) -> u32 {
    (phys_base & PTE_BASE_MASK) | (flags & (PAGE_SIZE - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::PageFlags;

    /// Installs a one-page identity-style mapping: virtual 0x4000 -> given
    /// physical page. Table lives at 0x1000 (L1) / 0x2000 (L2).
    fn mapped(mmu_flags: u32, phys: u32) -> (MemoryController, Mmu) {
        let mut mem = MemoryController::new(0x100000, false);
        mem.alloc_region(0x1000, 0x100, PageFlags::rw(), None).unwrap();
        mem.alloc_region(0x2000, 0x200, PageFlags::rw(), None).unwrap();
        mem.alloc_region(phys, 0x100, PageFlags::rwx(), None).unwrap();
        let vpn = 0x4000u32 >> PAGE_SHIFT; // 0x40: l1 index 0, l2 index 0x40
        mem.host_write_u32(0x1000, pte(0x2000, PTE_PRESENT)).unwrap();
        mem.host_write_u32(0x2000 + vpn * 4, pte(phys, PTE_PRESENT | mmu_flags))
            .unwrap();
        let mut mmu = Mmu::new(16);
        mmu.set_table_base(0x1000);
        mmu.enabled = true;
        (mem, mmu)
    }

    #[test]
    fn translation_hit() {
        let (mut mem, mut mmu) = mapped(PTE_READ | PTE_WRITE, 0x8000);
        let phys = mmu
            .translate(&mut mem, 0x4010, Access::Read, false, 0)
            .unwrap();
        assert_eq!(phys, 0x8010);
        // Second lookup comes from the cache.
        let phys = mmu
            .translate(&mut mem, 0x40fc, Access::Read, false, 0)
            .unwrap();
        assert_eq!(phys, 0x80fc);
    }

    #[test]
    fn translation_miss_page_faults() {
        let (mut mem, mut mmu) = mapped(PTE_READ, 0x8000);
        assert_eq!(
            mmu.translate(&mut mem, 0xdead_beef, Access::Read, false, 0),
            Err(Trap::PageFault {
                addr: 0xdead_beef,
                access: Access::Read,
                user: false
            })
        );
    }

    #[test]
    fn write_to_readonly_mapping_violates() {
        let (mut mem, mut mmu) = mapped(PTE_READ, 0x8000);
        assert_eq!(
            mmu.translate(&mut mem, 0x4000, Access::Write, false, 0),
            Err(Trap::AccessViolation {
                addr: 0x4000,
                access: Access::Write
            })
        );
    }

    #[test]
    fn kernel_page_from_user_violates() {
        let (mut mem, mut mmu) = mapped(PTE_READ | PTE_WRITE, 0x8000);
        assert!(mmu
            .translate(&mut mem, 0x4000, Access::Read, false, 0)
            .is_ok());
        assert_eq!(
            mmu.translate(&mut mem, 0x4000, Access::Read, true, 0),
            Err(Trap::AccessViolation {
                addr: 0x4000,
                access: Access::Read
            })
        );
    }

    #[test]
    fn store_sets_dirty_bit() {
        let (mut mem, mut mmu) = mapped(PTE_READ | PTE_WRITE, 0x8000);
        mmu.translate(&mut mem, 0x4000, Access::Write, false, 0)
            .unwrap();
        let vpn = 0x4000u32 >> PAGE_SHIFT;
        let entry = mem.read_u32(0x2000 + vpn * 4, None).unwrap();
        assert!(entry & PTE_DIRTY != 0);
    }

    #[test]
    fn table_base_change_flushes_cache() {
        let (mut mem, mut mmu) = mapped(PTE_READ, 0x8000);
        mmu.translate(&mut mem, 0x4000, Access::Read, false, 0)
            .unwrap();
        mmu.set_table_base(0x3000);
        // The cached mapping must not survive the base change.
        assert!(mmu
            .translate(&mut mem, 0x4000, Access::Read, false, 0)
            .is_err());
    }

    #[test]
    fn disabled_mmu_passes_through() {
        let mut mem = MemoryController::new(0x10000, false);
        let mut mmu = Mmu::new(16);
        assert_eq!(
            mmu.translate(&mut mem, 0x1234, Access::Read, false, 0),
            Ok(0x1234)
        );
    }
}
