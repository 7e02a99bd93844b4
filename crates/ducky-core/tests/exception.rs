mod common;

use common::*;
use ducky_core::cpu::insn::{Instr, Operand};
use ducky_core::mem::PageFlags;
use ducky_core::reg::REG_SP;
use ducky_core::{Exit, VmError};

const HANDLER: u32 = 0x2000;
const HANDLER_STACK: u32 = 0x3000;

/// Instructions installing `handler`/`stack` into the IVT slot for `vector`.
/// Clobbers r20..r22.
fn install_vector(vector: u32, handler: u32, stack: u32) -> Vec<Instr> {
    vec![
        Instr::Li {
            r: 20,
            imm: handler as i32,
        },
        Instr::Li {
            r: 21,
            imm: (vector * 8) as i32,
        },
        Instr::Stw {
            r: 20,
            base: 21,
            disp: 0,
        },
        Instr::Li {
            r: 22,
            imm: stack as i32,
        },
        Instr::Stw {
            r: 22,
            base: 21,
            disp: 4,
        },
    ]
}

#[test]
fn page_fault_handler_skips_faulting_instruction() {
    let mut machine = machine("");
    machine
        .mem
        .alloc_region(HANDLER_STACK - 0x400, 0x400, PageFlags::rw(), None)
        .unwrap();

    // Handler: pop the fault code, bump the saved ip past the faulting
    // instruction, return.
    load_at(
        &mut machine,
        HANDLER,
        &[
            Instr::Pop { r: 10 }, // fault kind
            Instr::Pop { r: 11 }, // fault address
            Instr::Lw {
                r: 12,
                base: REG_SP,
                disp: 0,
            },
            Instr::Add {
                r: 12,
                op: Operand::Imm(4),
            },
            Instr::Stw {
                r: 12,
                base: REG_SP,
                disp: 0,
            },
            Instr::RetInt,
        ],
    );

    let mut program = install_vector(1, HANDLER, HANDLER_STACK);
    program.extend([
        Instr::Li { r: 1, imm: 0 },
        Instr::Liu { r: 1, imm: 0xdead },
        Instr::Or {
            r: 1,
            op: Operand::Imm(0xbeef),
        },
        // No mapping at 0xdeadbeef: page fault.
        Instr::Lw {
            r: 0,
            base: 1,
            disp: 0,
        },
        Instr::Li { r: 2, imm: 1 },
        Instr::Hlt {
            code: Operand::Imm(9),
        },
    ]);
    load_program(&mut machine, &program);

    let hdt_base = machine.hdt_base();
    assert_eq!(machine.run().unwrap(), Exit::Halted(9));
    let core = &machine.cores[0];
    assert_eq!(core.regs.read(11), 0xdead_beef);
    assert_eq!(core.regs.read(10), 0); // kernel-mode read
    assert_eq!(core.regs.read(2), 1);
    // The faulting load never wrote its destination.
    assert_eq!(core.regs.read(0), hdt_base);
}

#[test]
fn unaligned_access_without_handler_is_fatal() {
    let mut machine = machine("");
    load_program(
        &mut machine,
        &[
            Instr::Li { r: 1, imm: 0x1001 },
            Instr::Lw {
                r: 0,
                base: 1,
                disp: 0,
            },
        ],
    );
    assert!(matches!(machine.run(), Err(VmError::Invariant(_))));
}

#[test]
fn permitted_unaligned_store_spans_pages() {
    let mut machine = machine_raw("[memory]\nsize = 65536\nforce-aligned-access = false\n");
    machine
        .mem
        .alloc_region(0x5000, 0x200, PageFlags::rw(), None)
        .unwrap();
    load_program(
        &mut machine,
        &[
            Instr::Li { r: 2, imm: 0 },
            Instr::Liu { r: 2, imm: 0x1122 },
            Instr::Or {
                r: 2,
                op: Operand::Imm(0x3344),
            },
            // Crosses the 0x5100 page boundary.
            Instr::Li { r: 1, imm: 0x50fe },
            Instr::Stw {
                r: 2,
                base: 1,
                disp: 0,
            },
            Instr::Lw {
                r: 3,
                base: 1,
                disp: 0,
            },
            Instr::Cmp {
                r: 3,
                op: Operand::Reg(2),
            },
            Instr::Be { offset: 1 },
            Instr::Hlt {
                code: Operand::Imm(2),
            },
            Instr::Hlt {
                code: Operand::Imm(1),
            },
        ],
    );
    assert_eq!(machine.run().unwrap(), Exit::Halted(1));
    assert_eq!(machine.mem.read_u8(0x50fe, None).unwrap(), 0x44);
    assert_eq!(machine.mem.read_u8(0x5101, None).unwrap(), 0x11);
}

#[test]
fn privilege_fault_reaches_its_vector() {
    let mut machine = machine("");
    machine
        .mem
        .alloc_region(HANDLER_STACK - 0x400, 0x400, PageFlags::rw(), None)
        .unwrap();
    // Vector 6: privilege violation. The handler just halts the machine.
    load_at(
        &mut machine,
        HANDLER,
        &[
            Instr::Li { r: 19, imm: 6 },
            Instr::Hlt {
                code: Operand::Reg(19),
            },
        ],
    );

    // Enter user mode by returning through a hand-built frame with a flags
    // word of zero, then try a privileged instruction.
    let mut program = install_vector(6, HANDLER, HANDLER_STACK);
    program.extend([
        Instr::Push {
            src: Operand::Imm(0x4000),
        }, // user sp
        Instr::Push {
            src: Operand::Imm(0),
        }, // flags: unprivileged
        Instr::La { r: 23, offset: 8 },
        Instr::Push {
            src: Operand::Reg(23),
        }, // resume after retint
        Instr::RetInt,
        Instr::Cli, // user mode: privilege fault
        Instr::Nop,
    ]);
    load_program(&mut machine, &program);
    machine
        .mem
        .alloc_region(0x4000 - 0x400, 0x400, PageFlags::rw(), None)
        .unwrap();

    assert_eq!(machine.run().unwrap(), Exit::Halted(6));
}
