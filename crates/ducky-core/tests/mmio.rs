mod common;

use common::*;
use ducky_core::cpu::insn::{Instr, Operand};
use ducky_core::devices::Keyboard;
use ducky_core::machine::MachineOptions;
use ducky_core::mem::PageFlags;
use ducky_core::Exit;

const HANDLER_STACK: u32 = 0x3000;
const KBD_BASE: i32 = 0x9100;
const TTY_BASE: i32 = 0x9200;

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
fn keyboard_echo_reaches_tty() {
    let extra = r#"
[device-0]
klass = "keyboard"
driver = "keyboard"
mmio-base = 0x9100
irq = 9

[device-1]
klass = "tty"
driver = "tty"
mmio-base = 0x9200
"#;
    let mut machine = machine_with_options(
        extra,
        MachineOptions {
            capture: true,
            ..Default::default()
        },
    );
    machine
        .mem
        .alloc_region(HANDLER_STACK - 0x400, 0x400, PageFlags::rw(), None)
        .unwrap();

    // ISR: drain one scancode, echo it to the tty data port.
    load_at(
        &mut machine,
        0x2000,
        &[
            Instr::Li { r: 8, imm: KBD_BASE },
            Instr::Lw {
                r: 10,
                base: 8,
                disp: 4,
            },
            Instr::Li { r: 9, imm: TTY_BASE },
            Instr::Stb {
                r: 10,
                base: 9,
                disp: 0,
            },
            Instr::Inc { r: 15 },
            Instr::RetInt,
        ],
    );

    let mut program = install_vector(9, 0x2000, HANDLER_STACK);
    program.push(Instr::Sti);
    program.extend([
        Instr::Cmp {
            r: 15,
            op: Operand::Imm(1),
        },
        Instr::Be { offset: 1 },
        Instr::J {
            target: Operand::Imm(-3),
        },
        Instr::Hlt {
            code: Operand::Imm(2),
        },
    ]);
    load_program(&mut machine, &program);

    machine
        .device_downcast_mut::<Keyboard>("device-0")
        .unwrap()
        .inject(b'A');

    assert_eq!(machine.run().unwrap(), Exit::Halted(2));
    assert_eq!(machine.cores[0].regs.read(10), 0x41);
    assert_eq!(machine.captured_output().unwrap(), b"A");
}

#[test]
fn keyboard_status_tracks_queue() {
    let extra = r#"
[device-0]
klass = "keyboard"
driver = "keyboard"
mmio-base = 0x9100
irq = 9
"#;
    let mut machine = machine(extra);
    load_program(
        &mut machine,
        &[
            Instr::Li { r: 8, imm: KBD_BASE },
            Instr::Lw {
                r: 4,
                base: 8,
                disp: 0,
            }, // status with one byte queued
            Instr::Lw {
                r: 5,
                base: 8,
                disp: 4,
            }, // drain it
            Instr::Lw {
                r: 6,
                base: 8,
                disp: 0,
            }, // status now empty
            Instr::Hlt {
                code: Operand::Imm(1),
            },
        ],
    );
    machine
        .device_downcast_mut::<Keyboard>("device-0")
        .unwrap()
        .inject(0x7f);

    assert_eq!(machine.run().unwrap(), Exit::Halted(1));
    let core = &machine.cores[0];
    assert_eq!(core.regs.read(4), 1);
    assert_eq!(core.regs.read(5), 0x7f);
    assert_eq!(core.regs.read(6), 0);
}

#[test]
fn conio_ports_route_to_terminal() {
    let extra = r#"
[device-0]
klass = "terminal"
driver = "terminal"
"#;
    let mut machine = machine_with_options(
        extra,
        MachineOptions {
            capture: true,
            ..Default::default()
        },
    );
    load_program(
        &mut machine,
        &[
            Instr::Li { r: 4, imm: 0x100 },
            Instr::Li { r: 5, imm: 0x42 },
            Instr::Outb { port: 4, value: 5 },
            // Nothing queued: stdin port reads zero.
            Instr::Inb { r: 6, port: 4 },
            Instr::Hlt {
                code: Operand::Imm(3),
            },
        ],
    );

    assert_eq!(machine.run().unwrap(), Exit::Halted(3));
    assert_eq!(machine.captured_output().unwrap(), b"B");
    assert_eq!(machine.cores[0].regs.read(6), 0);
}

#[test]
fn overlapping_mmio_regions_fail_boot() {
    let extra = r#"
[device-0]
klass = "keyboard"
driver = "keyboard"
mmio-base = 0x9100
irq = 9

[device-1]
klass = "tty"
driver = "tty"
mmio-base = 0x9104
"#;
    let text = format!("[memory]\nsize = 65536\n\n{extra}");
    let config = ducky_core::config::Config::parse(&text).unwrap();
    assert!(matches!(
        ducky_core::Machine::new(config),
        Err(ducky_core::VmError::AddressConflict(..))
    ));
}

#[test]
fn unknown_driver_fails_boot() {
    let extra = r#"
[device-0]
klass = "frobnicator"
driver = "acme.frob"
mmio-base = 0x9100
"#;
    let text = format!("[memory]\nsize = 65536\n\n{extra}");
    let config = ducky_core::config::Config::parse(&text).unwrap();
    assert!(matches!(
        ducky_core::Machine::new(config),
        Err(ducky_core::VmError::Configuration(_))
    ));
}
