mod common;

use common::*;
use ducky_core::cpu::insn::{Instr, Operand};
use ducky_core::mem::PageFlags;
use ducky_core::Exit;

const HANDLER_STACK: u32 = 0x3000;
const BLOCK_BASE: i32 = 0x9400;

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

fn block_machine(path: &std::path::Path) -> ducky_core::Machine {
    let extra = format!(
        "[device-0]\nklass = \"block\"\ndriver = \"block\"\nmmio-base = 0x9400\nirq = 10\nlatency = 4\nfilepath = {path:?}\n",
    );
    let mut machine = machine(&extra);
    machine
        .mem
        .alloc_region(HANDLER_STACK - 0x400, 0x400, PageFlags::rw(), None)
        .unwrap();
    load_at(
        &mut machine,
        0x2000,
        &[Instr::Inc { r: 15 }, Instr::RetInt],
    );
    machine
}

/// Program the controller for one transfer at `buffer`, sleep until the
/// completion IRQ, read back the status.
fn transfer_program(command: i32, buffer: i32) -> Vec<Instr> {
    let mut program = install_vector(10, 0x2000, HANDLER_STACK);
    program.extend([
        Instr::Li {
            r: 8,
            imm: BLOCK_BASE,
        },
        Instr::Li { r: 9, imm: buffer },
        Instr::Stw {
            r: 9,
            base: 8,
            disp: 0xc,
        },
        Instr::Li { r: 9, imm: 0 },
        Instr::Stw {
            r: 9,
            base: 8,
            disp: 8,
        },
        Instr::Li { r: 9, imm: 1 },
        Instr::Stw {
            r: 9,
            base: 8,
            disp: 0x10,
        },
        Instr::Sti,
        Instr::Li { r: 9, imm: command },
        Instr::Stw {
            r: 9,
            base: 8,
            disp: 0,
        },
        Instr::Idle,
        Instr::Lw {
            r: 16,
            base: 8,
            disp: 4,
        },
        Instr::Hlt {
            code: Operand::Imm(0),
        },
    ]);
    program
}

#[test]
fn write_command_reaches_backing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let mut machine = block_machine(&path);

    machine
        .mem
        .alloc_region(0x5000, 0x200, PageFlags::rw(), None)
        .unwrap();
    machine.mem.host_write(0x5000, b"ducky block payload!").unwrap();

    load_program(&mut machine, &transfer_program(2, 0x5000));
    assert_eq!(machine.run().unwrap(), Exit::Halted(0));

    let core = &machine.cores[0];
    assert_eq!(core.regs.read(15), 1, "completion irq fired");
    assert_eq!(core.regs.read(16), 2, "status read DONE");

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), 512);
    assert!(written.starts_with(b"ducky block payload!"));
}

#[test]
fn read_command_fills_guest_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let mut content = vec![0u8; 512];
    content[..9].copy_from_slice(b"from-disk");
    std::fs::write(&path, &content).unwrap();

    let mut machine = block_machine(&path);
    machine
        .mem
        .alloc_region(0x6000, 0x200, PageFlags::rw(), None)
        .unwrap();

    load_program(&mut machine, &transfer_program(1, 0x6000));
    assert_eq!(machine.run().unwrap(), Exit::Halted(0));

    assert_eq!(machine.cores[0].regs.read(16), 2);
    let mut buffer = [0u8; 9];
    machine.mem.host_read(0x6000, &mut buffer).unwrap();
    assert_eq!(&buffer, b"from-disk");
}

#[test]
fn short_backing_file_reads_as_zeroes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    std::fs::write(&path, b"tiny").unwrap();

    let mut machine = block_machine(&path);
    machine
        .mem
        .alloc_region(0x6000, 0x200, PageFlags::rw(), None)
        .unwrap();
    machine.mem.host_write(0x6000, &[0xffu8; 16]).unwrap();

    load_program(&mut machine, &transfer_program(1, 0x6000));
    assert_eq!(machine.run().unwrap(), Exit::Halted(0));

    let mut buffer = [0u8; 8];
    machine.mem.host_read(0x6000, &mut buffer).unwrap();
    assert_eq!(&buffer[..4], b"tiny");
    assert_eq!(&buffer[4..], &[0, 0, 0, 0]);
}
