mod common;

use common::*;
use ducky_core::cpu::insn::{Instr, Operand};
use ducky_core::{Exit, VmError};

#[test]
fn halt_with_code() {
    let mut machine = machine("");
    load_program(
        &mut machine,
        &[
            Instr::Li { r: 0, imm: 0x42 },
            Instr::Hlt {
                code: Operand::Reg(0),
            },
        ],
    );
    assert_eq!(machine.run().unwrap(), Exit::Halted(0x42));
    assert_eq!(machine.cores[0].regs.read(0), 0x42);
}

#[test]
fn graceful_halt_exits_zero() {
    let mut machine = machine("");
    load_program(
        &mut machine,
        &[Instr::Hlt {
            code: Operand::Imm(0),
        }],
    );
    assert_eq!(machine.run().unwrap(), Exit::Halted(0));
    assert!(machine.cores[0].flags.halted);
}

#[test]
fn loop_sums_with_branches() {
    // r2 = 5 + 4 + 3 + 2 + 1
    let mut machine = machine("");
    load_program(
        &mut machine,
        &[
            Instr::Li { r: 2, imm: 0 },
            Instr::Li { r: 3, imm: 5 },
            Instr::Add {
                r: 2,
                op: Operand::Reg(3),
            },
            Instr::Dec { r: 3 },
            Instr::Bnz { offset: -3 },
            Instr::Hlt {
                code: Operand::Reg(2),
            },
        ],
    );
    assert_eq!(machine.run().unwrap(), Exit::Halted(15));
}

#[test]
fn div_by_zero_preserves_destination() {
    // No handler installed: the fault escalates to a fatal double fault,
    // with r0 untouched by the failed division.
    let mut machine = machine("");
    load_program(
        &mut machine,
        &[
            Instr::Li { r: 0, imm: 7 },
            Instr::Li { r: 1, imm: 0 },
            Instr::Div {
                r: 0,
                op: Operand::Reg(1),
            },
        ],
    );
    assert!(matches!(machine.run(), Err(VmError::Invariant(_))));
    assert_eq!(machine.cores[0].regs.read(0), 7);
}

#[test]
fn instruction_budget_times_out() {
    let mut machine = machine("[machine]\nmax-instructions = 100\n");
    load_program(
        &mut machine,
        &[Instr::J {
            target: Operand::Imm(-1),
        }],
    );
    assert_eq!(machine.run().unwrap(), Exit::Timeout);
}

#[test]
fn frame_check_catches_clobbered_return() {
    let mut machine = machine("[cpu]\ncheck-frames = true\n");
    load_program(
        &mut machine,
        &[
            Instr::Call {
                target: Operand::Imm(2),
            },
            Instr::Hlt {
                code: Operand::Imm(0),
            },
            Instr::Nop,
            // The callee swaps the return address for garbage.
            Instr::Pop { r: 9 },
            Instr::Push {
                src: Operand::Imm(0x1234),
            },
            Instr::Ret,
        ],
    );
    assert!(matches!(machine.run(), Err(VmError::Invariant(_))));
}

#[test]
fn frame_check_passes_balanced_calls() {
    let mut machine = machine("[cpu]\ncheck-frames = true\n");
    load_program(
        &mut machine,
        &[
            Instr::Call {
                target: Operand::Imm(2),
            },
            Instr::Hlt {
                code: Operand::Imm(0),
            },
            Instr::Nop,
            Instr::Inc { r: 4 },
            Instr::Ret,
        ],
    );
    assert_eq!(machine.run().unwrap(), Exit::Halted(0));
    assert_eq!(machine.cores[0].regs.read(4), 1);
}
