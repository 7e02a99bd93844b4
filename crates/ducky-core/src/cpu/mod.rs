//! CPU core: register state, fetch/decode/execute and interrupt entry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bus::{Bus, DeviceCtx, Width};
use crate::interrupt::{InterruptController, Pending, IVT_ENTRY_SIZE};
use crate::mem::{CoreId, MemoryController};
use crate::mmu::Mmu;
use crate::reg::{Flags, RegisterFile};
use crate::trap::{Access, Trap, VmError, VECTOR_DOUBLE_FAULT};

pub mod exec;
pub mod insn;
pub mod math;

use insn::Instr;
use math::MathCoprocessor;

/// Result of advancing a core by one boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One instruction was executed (or a fault was queued for delivery).
    Executed,
    /// The core is halted or idle with nothing deliverable.
    Parked,
    /// `HLT` with a non-zero code: stop the whole machine.
    HaltMachine(u32),
}

/// Shared machine state a core executes against for one step.
pub struct System<'a> {
    pub mem: &'a mut MemoryController,
    pub bus: &'a mut Bus,
    pub intc: &'a mut InterruptController,
    pub clock: u64,
    pub ncores: usize,
}

impl System<'_> {
    /// Physical read, MMIO regions first, memory otherwise.
    pub fn read_phys(
        &mut self,
        addr: u32,
        width: Width,
        origin: Option<CoreId>,
    ) -> Result<u32, Trap> {
        let mut ctx = DeviceCtx {
            mem: &mut *self.mem,
            intc: &mut *self.intc,
            clock: self.clock,
        };
        if let Some(result) = self.bus.try_mmio_read(&mut ctx, addr, width) {
            return result;
        }
        match width {
            Width::Byte => self.mem.read_u8(addr, origin).map(u32::from),
            Width::Short => self.mem.read_u16(addr, origin).map(u32::from),
            Width::Word => self.mem.read_u32(addr, origin),
        }
    }

    /// Physical write, MMIO regions first, memory otherwise.
    pub fn write_phys(
        &mut self,
        addr: u32,
        width: Width,
        value: u32,
        origin: Option<CoreId>,
    ) -> Result<(), Trap> {
        let mut ctx = DeviceCtx {
            mem: &mut *self.mem,
            intc: &mut *self.intc,
            clock: self.clock,
        };
        if let Some(result) = self.bus.try_mmio_write(&mut ctx, addr, width, value) {
            return result;
        }
        match width {
            Width::Byte => self.mem.write_u8(addr, value as u8, origin),
            Width::Short => self.mem.write_u16(addr, value as u16, origin),
            Width::Word => self.mem.write_u32(addr, value, origin),
        }
    }

    pub fn io_read(&mut self, port: u16) -> Result<u8, Trap> {
        let mut ctx = DeviceCtx {
            mem: &mut *self.mem,
            intc: &mut *self.intc,
            clock: self.clock,
        };
        self.bus.io_read(&mut ctx, port)
    }

    pub fn io_write(&mut self, port: u16, value: u8) -> Result<(), Trap> {
        let mut ctx = DeviceCtx {
            mem: &mut *self.mem,
            intc: &mut *self.intc,
            clock: self.clock,
        };
        self.bus.io_write(&mut ctx, port, value)
    }
}

/// Advisory cache of decoded instructions keyed by physical address.
/// Invalidated wholesale whenever the memory controller observes a write to
/// an executable page.
#[derive(Debug, Clone, Default)]
struct ICache {
    map: BTreeMap<u32, Instr>,
    capacity: usize,
    epoch: u64,
}

impl ICache {
    fn get(&mut self, phys: u32, epoch: u64) -> Option<Instr> {
        if epoch != self.epoch {
            self.map.clear();
            self.epoch = epoch;
        }
        self.map.get(&phys).copied()
    }

    fn insert(&mut self, phys: u32, instr: Instr) {
        if self.capacity == 0 {
            return;
        }
        if self.map.len() >= self.capacity {
            let evict = *self.map.keys().next().unwrap();
            self.map.remove(&evict);
        }
        self.map.insert(phys, instr);
    }

    fn flush(&mut self) {
        self.map.clear();
    }
}

/// One CPU core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Core {
    pub id: CoreId,
    pub regs: RegisterFile,
    pub ip: u32,
    pub flags: Flags,
    pub mmu: Mmu,
    pub ivt_base: u32,
    pub instruction_set: u8,
    pub math: Option<MathCoprocessor>,
    pub idle: bool,
    boot_ip: u32,
    boot_sp: u32,
    boot_hdt: u32,
    check_frames: bool,
    shadow_frames: Vec<u32>,
    #[serde(skip)]
    frame_violation: Option<String>,
    #[serde(skip)]
    icache: ICache,
    /// Counter of each executed instruction, for the profiler.
    #[serde(skip)]
    pub inst_counter: BTreeMap<&'static str, u64>,
    #[serde(skip)]
    pub count_insts: bool,
}

/// Per-core tunables from the `[cpu]` configuration section.
#[derive(Debug, Clone, Copy)]
pub struct CoreParams {
    pub tlb_capacity: usize,
    pub icache_capacity: usize,
    pub math_coprocessor: bool,
    pub check_frames: bool,
}

impl Core {
    pub fn new(id: CoreId, params: CoreParams) -> Self {
        Core {
            id,
            regs: RegisterFile::new(),
            ip: 0,
            flags: Flags::boot(),
            mmu: Mmu::new(params.tlb_capacity),
            ivt_base: 0,
            instruction_set: 0,
            math: params.math_coprocessor.then(MathCoprocessor::new),
            idle: false,
            boot_ip: 0,
            boot_sp: 0,
            boot_hdt: 0,
            check_frames: params.check_frames,
            shadow_frames: Vec::new(),
            frame_violation: None,
            icache: ICache {
                map: BTreeMap::new(),
                capacity: params.icache_capacity,
                epoch: 0,
            },
            inst_counter: BTreeMap::new(),
            count_insts: false,
        }
    }

    /// Record the boot entry state and apply it.
    pub fn init_boot(&mut self, entry: u32, stack_top: u32, hdt_base: u32) {
        self.boot_ip = entry;
        self.boot_sp = stack_top;
        self.boot_hdt = hdt_base;
        self.reset();
    }

    /// Reset to boot state: entry ip, boot stack, privileged, interrupts
    /// disabled, r0 = HDT base, r1 = core id.
    pub fn reset(&mut self) {
        self.regs = RegisterFile::new();
        self.regs.write(0, self.boot_hdt);
        self.regs.write(1, self.id as u32);
        self.regs.set_sp(self.boot_sp);
        self.ip = self.boot_ip;
        self.flags = Flags::boot();
        self.mmu.enabled = false;
        self.mmu.flush_tlb();
        self.ivt_base = 0;
        self.instruction_set = 0;
        if let Some(math) = self.math.as_mut() {
            math.clear();
        }
        self.idle = false;
        self.shadow_frames.clear();
        self.icache.flush();
    }

    pub fn flush_caches(&mut self) {
        self.mmu.flush_tlb();
        self.icache.flush();
    }

    pub(crate) fn flush_icache(&mut self) {
        self.icache.flush();
    }

    fn user_mode(&self) -> bool {
        !self.flags.privileged
    }

    /// Virtual-address read. Unaligned accesses trap or decompose into byte
    /// reads, each translated separately so page-spanning accesses work.
    pub fn vread(&mut self, sys: &mut System<'_>, vaddr: u32, width: Width) -> Result<u32, Trap> {
        let user = self.user_mode();
        if vaddr % width.bytes() != 0 {
            if !sys.mem.permit_unaligned() {
                return Err(Trap::UnalignedAccess { addr: vaddr });
            }
            let mut value = 0u32;
            for i in 0..width.bytes() {
                let phys =
                    self.mmu
                        .translate(sys.mem, vaddr.wrapping_add(i), Access::Read, user, self.id)?;
                let byte = sys.read_phys(phys, Width::Byte, Some(self.id))?;
                value |= byte << (8 * i);
            }
            return Ok(value);
        }
        let phys = self.mmu.translate(sys.mem, vaddr, Access::Read, user, self.id)?;
        sys.read_phys(phys, width, Some(self.id))
    }

    /// Virtual-address write, counterpart of [`vread`].
    ///
    /// [`vread`]: Core::vread
    pub fn vwrite(
        &mut self,
        sys: &mut System<'_>,
        vaddr: u32,
        width: Width,
        value: u32,
    ) -> Result<(), Trap> {
        let user = self.user_mode();
        if vaddr % width.bytes() != 0 {
            if !sys.mem.permit_unaligned() {
                return Err(Trap::UnalignedAccess { addr: vaddr });
            }
            for i in 0..width.bytes() {
                let phys = self.mmu.translate(
                    sys.mem,
                    vaddr.wrapping_add(i),
                    Access::Write,
                    user,
                    self.id,
                )?;
                sys.write_phys(phys, Width::Byte, (value >> (8 * i)) & 0xff, Some(self.id))?;
            }
            return Ok(());
        }
        let phys = self
            .mmu
            .translate(sys.mem, vaddr, Access::Write, user, self.id)?;
        sys.write_phys(phys, width, value, Some(self.id))
    }

    pub fn push(&mut self, sys: &mut System<'_>, value: u32) -> Result<(), Trap> {
        let sp = self.regs.sp().wrapping_sub(4);
        self.vwrite(sys, sp, Width::Word, value)?;
        self.regs.set_sp(sp);
        Ok(())
    }

    pub fn pop(&mut self, sys: &mut System<'_>) -> Result<u32, Trap> {
        let sp = self.regs.sp();
        let value = self.vread(sys, sp, Width::Word)?;
        self.regs.set_sp(sp.wrapping_add(4));
        Ok(value)
    }

    /// Fetch and decode the instruction at ip, then advance ip past it.
    fn fetch(&mut self, sys: &mut System<'_>) -> Result<Instr, Trap> {
        let vaddr = self.ip;
        if vaddr % 4 != 0 {
            return Err(Trap::UnalignedAccess { addr: vaddr });
        }
        let user = self.user_mode();
        let phys = self
            .mmu
            .translate(sys.mem, vaddr, Access::Execute, user, self.id)?;
        if let Some(instr) = self.icache.get(phys, sys.mem.exec_epoch()) {
            self.ip = vaddr.wrapping_add(4);
            return Ok(instr);
        }
        if sys.bus.is_mmio(phys) {
            return Err(Trap::AccessViolation {
                addr: vaddr,
                access: Access::Execute,
            });
        }
        let word = sys.mem.fetch_u32(phys, Some(self.id))?;
        let instr = insn::decode(word, self.instruction_set)?;
        let cacheable = sys
            .mem
            .page(phys)
            .map(|p| p.flags.cached)
            .unwrap_or(false);
        if cacheable {
            self.icache.insert(phys, instr);
        }
        self.ip = vaddr.wrapping_add(4);
        Ok(instr)
    }

    /// Advance the core by one boundary: service a pending interrupt, then
    /// fetch-decode-execute one instruction. A trap raised anywhere inside
    /// converts to an interrupt consumed at the next boundary.
    pub fn step(&mut self, sys: &mut System<'_>) -> Result<StepOutcome, VmError> {
        if self.flags.halted || self.idle {
            match sys.intc.pop(self.id, self.flags.hwint_enabled) {
                Some(pending) => {
                    // Delivery is the wake event for both halt and idle.
                    self.flags.halted = false;
                    self.idle = false;
                    self.deliver(sys, pending)?;
                }
                None => return Ok(StepOutcome::Parked),
            }
        } else if let Some(pending) = sys.intc.pop(self.id, self.flags.hwint_enabled) {
            self.deliver(sys, pending)?;
        }

        let inst_start = self.ip;
        let result = match self.fetch(sys) {
            Ok(instr) => {
                if self.count_insts {
                    *self.inst_counter.entry(instr.mnemonic()).or_insert(0) += 1;
                }
                exec::execute(self, sys, instr)
            }
            Err(trap) => Err(trap),
        };
        if let Some(message) = self.frame_violation.take() {
            return Err(VmError::Invariant(message));
        }
        match result {
            Ok(outcome) => Ok(outcome),
            Err(trap) => {
                // Restart semantics: the saved ip names the faulting
                // instruction.
                self.ip = inst_start;
                let trap = self.tag_user(trap);
                sys.intc.raise_fault(self.id, trap);
                Ok(StepOutcome::Executed)
            }
        }
    }

    fn tag_user(&self, trap: Trap) -> Trap {
        match trap {
            Trap::PageFault { addr, access, .. } => Trap::PageFault {
                addr,
                access,
                user: self.user_mode(),
            },
            other => other,
        }
    }

    fn deliver(&mut self, sys: &mut System<'_>, pending: Pending) -> Result<(), VmError> {
        let (vector, fault_args) = match &pending {
            Pending::Fault(trap) => (trap.vector(), trap.fault_args()),
            Pending::Irq(irq) => (*irq, None),
        };
        tracing::debug!(core = self.id, vector, "delivering interrupt");
        match self.enter_handler(sys, vector, fault_args) {
            Ok(()) => Ok(()),
            Err(trap) => {
                if vector == VECTOR_DOUBLE_FAULT {
                    return Err(VmError::Invariant(format!(
                        "core {}: trap during double-fault delivery: {trap}",
                        self.id
                    )));
                }
                tracing::warn!(core = self.id, vector, %trap, "double fault");
                self.enter_handler(sys, VECTOR_DOUBLE_FAULT, None)
                    .map_err(|t| {
                        VmError::Invariant(format!(
                            "core {}: trap during double-fault delivery: {t}",
                            self.id
                        ))
                    })
            }
        }
    }

    /// Switch into the handler named by the IVT vector. Frame layout on the
    /// handler stack, top down: old ip, old flags word, old sp; memory
    /// faults push their fault kind and address above that.
    pub(crate) fn enter_handler(
        &mut self,
        sys: &mut System<'_>,
        vector: u32,
        fault_args: Option<(u32, u32)>,
    ) -> Result<(), Trap> {
        let entry = self.ivt_base.wrapping_add(vector * IVT_ENTRY_SIZE);
        let handler_ip = sys.read_phys(entry, Width::Word, Some(self.id))?;
        let handler_sp = sys.read_phys(entry.wrapping_add(4), Width::Word, Some(self.id))?;
        if handler_ip == 0 {
            return Err(Trap::DoubleFault);
        }

        let old_sp = self.regs.sp();
        let old_flags = self.flags.to_word();
        let old_ip = self.ip;

        self.flags.privileged = true;
        self.regs.set_sp(handler_sp);
        self.push(sys, old_sp)?;
        self.push(sys, old_flags)?;
        self.push(sys, old_ip)?;
        if let Some((kind, addr)) = fault_args {
            self.push(sys, addr)?;
            self.push(sys, kind)?;
        }

        self.ip = handler_ip;
        self.flags.hwint_enabled = false;
        Ok(())
    }

    pub(crate) fn note_call(&mut self, return_ip: u32) {
        if self.check_frames {
            self.shadow_frames.push(return_ip);
        }
    }

    pub(crate) fn note_ret(&mut self, return_ip: u32) {
        if !self.check_frames {
            return;
        }
        match self.shadow_frames.pop() {
            Some(expected) if expected == return_ip => {}
            Some(expected) => {
                self.frame_violation = Some(format!(
                    "core {}: ret to {return_ip:#010x}, call frame expected {expected:#010x}",
                    self.id
                ));
            }
            None => {
                self.frame_violation = Some(format!(
                    "core {}: ret to {return_ip:#010x} without a call frame",
                    self.id
                ));
            }
        }
    }
}
