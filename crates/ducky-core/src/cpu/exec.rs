//! Per-opcode execution semantics.

use crate::bus::Width;
use crate::cpu::insn::{Instr, Operand};
use crate::cpu::{Core, StepOutcome, System};
use crate::interrupt::{FIRST_DEVICE_IRQ, IVT_SIZE};
use crate::trap::Trap;

fn operand(core: &Core, op: Operand) -> u32 {
    match op {
        Operand::Reg(r) => core.regs.read(r),
        Operand::Imm(imm) => imm as u32,
    }
}

fn arith_flags(core: &mut Core, result: u32, overflow: bool) {
    core.flags.zero = result == 0;
    core.flags.sign = (result as i32) < 0;
    core.flags.overflow = overflow;
}

fn logic(core: &mut Core, r: u8, value: u32) {
    core.regs.write(r, value);
    arith_flags(core, value, false);
}

fn require_privileged(core: &Core) -> Result<(), Trap> {
    if core.flags.privileged {
        Ok(())
    } else {
        Err(Trap::PrivilegeFault)
    }
}

/// Branch targets are word offsets relative to the already-incremented ip.
fn relative(ip: u32, words: i32) -> u32 {
    ip.wrapping_add((words as u32).wrapping_mul(4))
}

fn jump_target(core: &Core, target: Operand) -> u32 {
    match target {
        Operand::Reg(r) => core.regs.read(r),
        Operand::Imm(words) => relative(core.ip, words),
    }
}

/// Execute one decoded instruction. Any returned trap converts to a pending
/// interrupt at the boundary.
pub fn execute(core: &mut Core, sys: &mut System<'_>, instr: Instr) -> Result<StepOutcome, Trap> {
    match instr {
        Instr::Nop => {}

        // Data movement.
        Instr::Li { r, imm } => core.regs.write(r, imm as u32),
        Instr::Liu { r, imm } => {
            let low = core.regs.read(r) & 0xffff;
            core.regs.write(r, low | (u32::from(imm) << 16));
        }
        Instr::La { r, offset } => {
            let addr = core.ip.wrapping_add(offset as u32);
            core.regs.write(r, addr);
        }
        Instr::Lw { r, base, disp } => {
            let addr = core.regs.read(base).wrapping_add(disp as u32);
            let value = core.vread(sys, addr, Width::Word)?;
            core.regs.write(r, value);
        }
        Instr::Ls { r, base, disp } => {
            let addr = core.regs.read(base).wrapping_add(disp as u32);
            let value = core.vread(sys, addr, Width::Short)?;
            core.regs.write(r, value);
        }
        Instr::Lb { r, base, disp } => {
            let addr = core.regs.read(base).wrapping_add(disp as u32);
            let value = core.vread(sys, addr, Width::Byte)?;
            core.regs.write(r, value);
        }
        Instr::Stw { r, base, disp } => {
            let addr = core.regs.read(base).wrapping_add(disp as u32);
            core.vwrite(sys, addr, Width::Word, core.regs.read(r))?;
        }
        Instr::Sts { r, base, disp } => {
            let addr = core.regs.read(base).wrapping_add(disp as u32);
            core.vwrite(sys, addr, Width::Short, core.regs.read(r))?;
        }
        Instr::Stb { r, base, disp } => {
            let addr = core.regs.read(base).wrapping_add(disp as u32);
            core.vwrite(sys, addr, Width::Byte, core.regs.read(r))?;
        }
        Instr::Mov { dst, src } => core.regs.write(dst, core.regs.read(src)),
        Instr::Swp { a, b } => {
            let left = core.regs.read(a);
            let right = core.regs.read(b);
            core.regs.write(a, right);
            core.regs.write(b, left);
        }

        // Arithmetic. Overflow sets the flag, it never traps.
        Instr::Add { r, op } => {
            let (result, overflow) = core.regs.read(r).overflowing_add(operand(core, op));
            core.regs.write(r, result);
            arith_flags(core, result, overflow);
        }
        Instr::Sub { r, op } => {
            let (result, overflow) = core.regs.read(r).overflowing_sub(operand(core, op));
            core.regs.write(r, result);
            arith_flags(core, result, overflow);
        }
        Instr::Mul { r, op } => {
            let a = core.regs.read(r);
            let b = operand(core, op);
            let wide = u64::from(a) * u64::from(b);
            let result = wide as u32;
            core.regs.write(r, result);
            arith_flags(core, result, wide > u64::from(u32::MAX));
        }
        Instr::Div { r, op } => {
            let divisor = operand(core, op);
            if divisor == 0 {
                return Err(Trap::DivisionByZero);
            }
            let result = core.regs.read(r) / divisor;
            core.regs.write(r, result);
            arith_flags(core, result, false);
        }
        Instr::Mod { r, op } => {
            let divisor = operand(core, op);
            if divisor == 0 {
                return Err(Trap::DivisionByZero);
            }
            let result = core.regs.read(r) % divisor;
            core.regs.write(r, result);
            arith_flags(core, result, false);
        }
        Instr::Inc { r } => {
            let (result, overflow) = core.regs.read(r).overflowing_add(1);
            core.regs.write(r, result);
            arith_flags(core, result, overflow);
        }
        Instr::Dec { r } => {
            let (result, overflow) = core.regs.read(r).overflowing_sub(1);
            core.regs.write(r, result);
            arith_flags(core, result, overflow);
        }
        Instr::Neg { r } => {
            let value = core.regs.read(r);
            let result = value.wrapping_neg();
            core.regs.write(r, result);
            arith_flags(core, result, value == 0x8000_0000);
        }

        // Logic and shifts.
        Instr::And { r, op } => logic(core, r, core.regs.read(r) & operand(core, op)),
        Instr::Or { r, op } => logic(core, r, core.regs.read(r) | operand(core, op)),
        Instr::Xor { r, op } => logic(core, r, core.regs.read(r) ^ operand(core, op)),
        Instr::Not { r } => logic(core, r, !core.regs.read(r)),
        Instr::Shl { r, op } => {
            let count = operand(core, op) & 0x1f;
            logic(core, r, core.regs.read(r) << count);
        }
        Instr::Shr { r, op } => {
            let count = operand(core, op) & 0x1f;
            logic(core, r, core.regs.read(r) >> count);
        }
        Instr::Shra { r, op } => {
            let count = operand(core, op) & 0x1f;
            logic(core, r, ((core.regs.read(r) as i32) >> count) as u32);
        }

        // Comparison.
        Instr::Cmp { r, op } => {
            let a = core.regs.read(r);
            let b = operand(core, op);
            core.flags.equal = a == b;
            core.flags.zero = a == b;
            core.flags.sign = (a as i32) < (b as i32);
            core.flags.overflow = false;
        }
        Instr::Cmpu { r, op } => {
            let a = core.regs.read(r);
            let b = operand(core, op);
            core.flags.equal = a == b;
            core.flags.zero = a == b;
            core.flags.sign = a < b;
            core.flags.overflow = false;
        }

        // Control flow.
        Instr::J { target } => core.ip = jump_target(core, target),
        Instr::Be { offset } => {
            if core.flags.equal {
                core.ip = relative(core.ip, offset);
            }
        }
        Instr::Bne { offset } => {
            if !core.flags.equal {
                core.ip = relative(core.ip, offset);
            }
        }
        Instr::Bz { offset } => {
            if core.flags.zero {
                core.ip = relative(core.ip, offset);
            }
        }
        Instr::Bnz { offset } => {
            if !core.flags.zero {
                core.ip = relative(core.ip, offset);
            }
        }
        Instr::Bg { offset } => {
            if !core.flags.sign && !core.flags.equal {
                core.ip = relative(core.ip, offset);
            }
        }
        Instr::Bge { offset } => {
            if !core.flags.sign {
                core.ip = relative(core.ip, offset);
            }
        }
        Instr::Bl { offset } => {
            if core.flags.sign {
                core.ip = relative(core.ip, offset);
            }
        }
        Instr::Ble { offset } => {
            if core.flags.sign || core.flags.equal {
                core.ip = relative(core.ip, offset);
            }
        }
        Instr::Call { target } => {
            let dest = jump_target(core, target);
            let return_ip = core.ip;
            core.push(sys, return_ip)?;
            core.note_call(return_ip);
            core.ip = dest;
        }
        Instr::Ret => {
            let return_ip = core.pop(sys)?;
            core.note_ret(return_ip);
            core.ip = return_ip;
        }

        // Stack.
        Instr::Push { src } => {
            let value = operand(core, src);
            core.push(sys, value)?;
        }
        Instr::Pop { r } => {
            let value = core.pop(sys)?;
            core.regs.write(r, value);
        }

        // Interrupts.
        Instr::Int { vector } => {
            let vector = operand(core, vector);
            if vector >= IVT_SIZE {
                return Err(Trap::InvalidIrq(vector));
            }
            // Software interrupts enter the handler immediately and are not
            // maskable.
            core.enter_handler(sys, vector, None)?;
        }
        Instr::RetInt => {
            require_privileged(core)?;
            let ip = core.pop(sys)?;
            let flags = core.pop(sys)?;
            let sp = core.pop(sys)?;
            core.ip = ip;
            core.flags = crate::reg::Flags::from_word(flags);
            core.regs.set_sp(sp);
        }
        Instr::Ipi { core: target, irq } => {
            require_privileged(core)?;
            let target = core.regs.read(target) as usize;
            let irq = core.regs.read(irq);
            if !(FIRST_DEVICE_IRQ..IVT_SIZE).contains(&irq) || target >= sys.ncores {
                return Err(Trap::InvalidIrq(irq));
            }
            sys.intc.raise_on(target, irq);
        }

        // Privileged machine control.
        Instr::Hlt { code } => {
            require_privileged(core)?;
            let code = operand(core, code);
            if code == 0 {
                tracing::info!(core = core.id, "core halted");
                core.flags.halted = true;
            } else {
                tracing::info!(core = core.id, code, "machine halt requested");
                return Ok(StepOutcome::HaltMachine(code));
            }
        }
        Instr::Rst => {
            require_privileged(core)?;
            core.reset();
        }
        Instr::Idle => {
            require_privileged(core)?;
            core.idle = true;
        }
        Instr::Lpm { r } => {
            require_privileged(core)?;
            core.mmu.enabled = core.regs.read(r) != 0;
            core.mmu.flush_tlb();
        }
        Instr::Lpt { r } => {
            require_privileged(core)?;
            core.mmu.set_table_base(core.regs.read(r));
        }
        Instr::Livt { r } => {
            require_privileged(core)?;
            core.ivt_base = core.regs.read(r);
        }
        Instr::Cli => {
            require_privileged(core)?;
            core.flags.hwint_enabled = false;
        }
        Instr::Sti => {
            require_privileged(core)?;
            core.flags.hwint_enabled = true;
        }
        Instr::Fptc => {
            require_privileged(core)?;
            core.flush_caches();
        }
        Instr::Sis { set } => {
            let supported = set == 0 || (set == 1 && core.math.is_some());
            if !supported {
                return Err(Trap::InvalidOpcode(u32::from(set)));
            }
            core.instruction_set = set;
            // Decodes are set-relative, cached ones must not leak across.
            core.flush_icache();
        }

        // Port I/O.
        Instr::Inb { r, port } => {
            require_privileged(core)?;
            let port = core.regs.read(port) as u16;
            let value = sys.io_read(port)?;
            core.regs.write(r, u32::from(value));
        }
        Instr::Outb { port, value } => {
            require_privileged(core)?;
            let port = core.regs.read(port) as u16;
            let value = core.regs.read(value) as u8;
            sys.io_write(port, value)?;
        }

        // Coprocessor escape.
        Instr::Cop(cop) => match core.math.as_mut() {
            Some(math) => {
                let regs = &mut core.regs;
                math.execute(regs, cop)?;
            }
            None => return Err(Trap::InvalidOpcode(0)),
        },
    }
    Ok(StepOutcome::Executed)
}
