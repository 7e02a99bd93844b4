//! Physical memory controller.
//!
//! Memory is a sparse set of 256-byte pages. Pages carry access flags and an
//! optional owning core; guest accesses are checked against both. Aligned
//! word and short accesses hit the owning page directly, unaligned accesses
//! either trap or decompose into byte operations depending on configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::trap::{Access, Trap, VmError};

/// Physical page size in bytes.
pub const PAGE_SIZE: u32 = 256;
/// log2(PAGE_SIZE).
pub const PAGE_SHIFT: u32 = 8;

/// Index of a core inside the machine.
pub type CoreId = usize;

/// Access flags carried by a physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFlags {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub dirty: bool,
    pub cached: bool,
}

impl PageFlags {
    /// Read/write data page.
    pub fn rw() -> Self {
        PageFlags {
            readable: true,
            writable: true,
            executable: false,
            dirty: false,
            cached: true,
        }
    }

    /// Read/execute code page.
    pub fn rx() -> Self {
        PageFlags {
            readable: true,
            writable: false,
            executable: true,
            dirty: false,
            cached: true,
        }
    }

    /// Fully permissive page.
    pub fn rwx() -> Self {
        PageFlags {
            readable: true,
            writable: true,
            executable: true,
            dirty: false,
            cached: true,
        }
    }
}

/// One physical page. A page without an owner is global.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    data: Vec<u8>,
    pub flags: PageFlags,
    pub owner: Option<CoreId>,
}

impl Page {
    fn new(flags: PageFlags, owner: Option<CoreId>) -> Self {
        Page {
            data: vec![0; PAGE_SIZE as usize],
            flags,
            owner,
        }
    }
}

/// The physical memory controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryController {
    pages: BTreeMap<u32, Page>,
    size: u32,
    permit_unaligned: bool,
    exec_epoch: u64,
}

impl MemoryController {
    pub fn new(size: u32, permit_unaligned: bool) -> Self {
        MemoryController {
            pages: BTreeMap::new(),
            size: size & !(PAGE_SIZE - 1),
            permit_unaligned,
            exec_epoch: 0,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn permit_unaligned(&self) -> bool {
        self.permit_unaligned
    }

    /// Bumped on every write to an executable page; instruction caches
    /// compare against it before trusting a cached decode.
    pub fn exec_epoch(&self) -> u64 {
        self.exec_epoch
    }

    /// Allocate the first free page. Pages are zeroed on allocation.
    pub fn alloc_page(
        &mut self,
        flags: PageFlags,
        owner: Option<CoreId>,
    ) -> Result<u32, VmError> {
        let mut pfn = 0;
        while pfn < self.size >> PAGE_SHIFT {
            if !self.pages.contains_key(&pfn) {
                self.pages.insert(pfn, Page::new(flags, owner));
                return Ok(pfn << PAGE_SHIFT);
            }
            pfn += 1;
        }
        Err(VmError::InvalidAddress(self.size))
    }

    /// Allocate a specific page by base address.
    pub fn alloc_page_at(
        &mut self,
        base: u32,
        flags: PageFlags,
        owner: Option<CoreId>,
    ) -> Result<(), VmError> {
        if base % PAGE_SIZE != 0 {
            return Err(VmError::InvalidPage(base));
        }
        if base >= self.size {
            return Err(VmError::InvalidAddress(base));
        }
        let pfn = base >> PAGE_SHIFT;
        if self.pages.contains_key(&pfn) {
            return Err(VmError::InvalidPage(base));
        }
        self.pages.insert(pfn, Page::new(flags, owner));
        Ok(())
    }

    /// Allocate every page covering `[base, base + len)`. Pages that already
    /// exist keep their contents and gain the union of the flags, which lets
    /// loaders place adjacent sections on a shared page.
    pub fn alloc_region(
        &mut self,
        base: u32,
        len: u32,
        flags: PageFlags,
        owner: Option<CoreId>,
    ) -> Result<(), VmError> {
        if len == 0 {
            return Ok(());
        }
        let end = base
            .checked_add(len - 1)
            .ok_or(VmError::InvalidAddress(base))?;
        if end >= self.size {
            return Err(VmError::InvalidAddress(end));
        }
        for pfn in (base >> PAGE_SHIFT)..=(end >> PAGE_SHIFT) {
            match self.pages.get_mut(&pfn) {
                Some(page) => {
                    page.flags.readable |= flags.readable;
                    page.flags.writable |= flags.writable;
                    page.flags.executable |= flags.executable;
                }
                None => {
                    self.pages.insert(pfn, Page::new(flags, owner));
                }
            }
        }
        Ok(())
    }

    /// Free a page. Freeing an unallocated page fails.
    pub fn free_page(&mut self, base: u32) -> Result<(), VmError> {
        if base % PAGE_SIZE != 0 {
            return Err(VmError::InvalidPage(base));
        }
        self.pages
            .remove(&(base >> PAGE_SHIFT))
            .map(|_| ())
            .ok_or(VmError::InvalidPage(base))
    }

    pub fn page(&self, base: u32) -> Option<&Page> {
        self.pages.get(&(base >> PAGE_SHIFT))
    }

    pub fn page_mut(&mut self, base: u32) -> Option<&mut Page> {
        self.pages.get_mut(&(base >> PAGE_SHIFT))
    }

    fn check(page: &Page, addr: u32, access: Access, origin: Option<CoreId>) -> Result<(), Trap> {
        if let (Some(owner), Some(core)) = (page.owner, origin) {
            if owner != core {
                return Err(Trap::AccessViolation { addr, access });
            }
        }
        let permitted = match access {
            Access::Read => page.flags.readable,
            Access::Write => page.flags.writable,
            Access::Execute => page.flags.executable,
        };
        if !permitted {
            return Err(Trap::AccessViolation { addr, access });
        }
        Ok(())
    }

    fn page_checked(
        &self,
        addr: u32,
        access: Access,
        origin: Option<CoreId>,
    ) -> Result<&Page, Trap> {
        let page = self.pages.get(&(addr >> PAGE_SHIFT)).ok_or(Trap::PageFault {
            addr,
            access,
            user: false,
        })?;
        Self::check(page, addr, access, origin)?;
        Ok(page)
    }

    pub fn read_u8(&self, addr: u32, origin: Option<CoreId>) -> Result<u8, Trap> {
        let page = self.page_checked(addr, Access::Read, origin)?;
        Ok(page.data[(addr % PAGE_SIZE) as usize])
    }

    pub fn read_u16(&self, addr: u32, origin: Option<CoreId>) -> Result<u16, Trap> {
        if addr % 2 != 0 {
            return self.read_unaligned(addr, 2, origin).map(|v| v as u16);
        }
        let page = self.page_checked(addr, Access::Read, origin)?;
        let off = (addr % PAGE_SIZE) as usize;
        Ok(u16::from_le_bytes([page.data[off], page.data[off + 1]]))
    }

    pub fn read_u32(&self, addr: u32, origin: Option<CoreId>) -> Result<u32, Trap> {
        if addr % 4 != 0 {
            return self.read_unaligned(addr, 4, origin);
        }
        let page = self.page_checked(addr, Access::Read, origin)?;
        let off = (addr % PAGE_SIZE) as usize;
        Ok(u32::from_le_bytes([
            page.data[off],
            page.data[off + 1],
            page.data[off + 2],
            page.data[off + 3],
        ]))
    }

    /// Instruction fetch: like `read_u32` but checked against the executable
    /// flag. Always requires word alignment.
    pub fn fetch_u32(&self, addr: u32, origin: Option<CoreId>) -> Result<u32, Trap> {
        if addr % 4 != 0 {
            return Err(Trap::UnalignedAccess { addr });
        }
        let page = self.page_checked(addr, Access::Execute, origin)?;
        let off = (addr % PAGE_SIZE) as usize;
        Ok(u32::from_le_bytes([
            page.data[off],
            page.data[off + 1],
            page.data[off + 2],
            page.data[off + 3],
        ]))
    }

    fn read_unaligned(&self, addr: u32, len: u32, origin: Option<CoreId>) -> Result<u32, Trap> {
        if !self.permit_unaligned {
            return Err(Trap::UnalignedAccess { addr });
        }
        // Decomposed into byte ops in natural address order, not atomic.
        let mut value = 0u32;
        for i in 0..len {
            let byte = self.read_u8(addr.wrapping_add(i), origin)?;
            value |= u32::from(byte) << (8 * i);
        }
        Ok(value)
    }

    pub fn write_u8(&mut self, addr: u32, value: u8, origin: Option<CoreId>) -> Result<(), Trap> {
        let page = self
            .pages
            .get_mut(&(addr >> PAGE_SHIFT))
            .ok_or(Trap::PageFault {
                addr,
                access: Access::Write,
                user: false,
            })?;
        Self::check(page, addr, Access::Write, origin)?;
        page.data[(addr % PAGE_SIZE) as usize] = value;
        page.flags.dirty = true;
        if page.flags.executable {
            self.exec_epoch += 1;
        }
        Ok(())
    }

    pub fn write_u16(
        &mut self,
        addr: u32,
        value: u16,
        origin: Option<CoreId>,
    ) -> Result<(), Trap> {
        if addr % 2 != 0 {
            return self.write_unaligned(addr, &value.to_le_bytes(), origin);
        }
        self.write_aligned(addr, &value.to_le_bytes(), origin)
    }

    pub fn write_u32(
        &mut self,
        addr: u32,
        value: u32,
        origin: Option<CoreId>,
    ) -> Result<(), Trap> {
        if addr % 4 != 0 {
            return self.write_unaligned(addr, &value.to_le_bytes(), origin);
        }
        self.write_aligned(addr, &value.to_le_bytes(), origin)
    }

    fn write_aligned(
        &mut self,
        addr: u32,
        bytes: &[u8],
        origin: Option<CoreId>,
    ) -> Result<(), Trap> {
        let page = self
            .pages
            .get_mut(&(addr >> PAGE_SHIFT))
            .ok_or(Trap::PageFault {
                addr,
                access: Access::Write,
                user: false,
            })?;
        Self::check(page, addr, Access::Write, origin)?;
        let off = (addr % PAGE_SIZE) as usize;
        page.data[off..off + bytes.len()].copy_from_slice(bytes);
        page.flags.dirty = true;
        if page.flags.executable {
            self.exec_epoch += 1;
        }
        Ok(())
    }

    fn write_unaligned(
        &mut self,
        addr: u32,
        bytes: &[u8],
        origin: Option<CoreId>,
    ) -> Result<(), Trap> {
        if !self.permit_unaligned {
            return Err(Trap::UnalignedAccess { addr });
        }
        for (i, byte) in bytes.iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), *byte, origin)?;
        }
        Ok(())
    }

    /// Host-side bulk write. Bypasses access flags and ownership; used by the
    /// loader, the HDT builder and device DMA. The target pages must exist.
    pub fn host_write(&mut self, base: u32, bytes: &[u8]) -> Result<(), VmError> {
        let mut addr = base;
        for byte in bytes {
            let page = self
                .pages
                .get_mut(&(addr >> PAGE_SHIFT))
                .ok_or(VmError::InvalidAddress(addr))?;
            page.data[(addr % PAGE_SIZE) as usize] = *byte;
            if page.flags.executable {
                self.exec_epoch += 1;
            }
            addr = addr
                .checked_add(1)
                .ok_or(VmError::InvalidAddress(addr))?;
        }
        Ok(())
    }

    /// Host-side bulk read, counterpart of [`host_write`].
    ///
    /// [`host_write`]: MemoryController::host_write
    pub fn host_read(&self, base: u32, buf: &mut [u8]) -> Result<(), VmError> {
        let mut addr = base;
        for slot in buf.iter_mut() {
            let page = self
                .pages
                .get(&(addr >> PAGE_SHIFT))
                .ok_or(VmError::InvalidAddress(addr))?;
            *slot = page.data[(addr % PAGE_SIZE) as usize];
            addr = addr
                .checked_add(1)
                .ok_or(VmError::InvalidAddress(addr))?;
        }
        Ok(())
    }

    pub(crate) fn host_write_u32(&mut self, addr: u32, value: u32) -> Result<(), VmError> {
        self.host_write(addr, &value.to_le_bytes())
    }
}
