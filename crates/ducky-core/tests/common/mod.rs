//! Shared harness for the integration tests: build a machine from an inline
//! configuration and feed it encoded instruction words.

use ducky_core::config::Config;
use ducky_core::cpu::insn::Instr;
use ducky_core::machine::MachineOptions;
use ducky_core::Machine;

pub const CODE_BASE: u32 = 0x1000;

pub fn machine(extra: &str) -> Machine {
    machine_with_options(extra, MachineOptions::default())
}

pub fn machine_with_options(extra: &str, options: MachineOptions) -> Machine {
    let text = format!("[memory]\nsize = 65536\n\n{extra}");
    let config = Config::parse(&text).unwrap();
    Machine::with_options(config, options).unwrap()
}

/// Full control over the configuration text.
pub fn machine_raw(text: &str) -> Machine {
    Machine::new(Config::parse(text).unwrap()).unwrap()
}

pub fn assemble(instrs: &[Instr]) -> Vec<u8> {
    instrs
        .iter()
        .flat_map(|instr| instr.encode().to_le_bytes())
        .collect()
}

/// Place a program at `CODE_BASE` and point every core at it.
pub fn load_program(machine: &mut Machine, instrs: &[Instr]) {
    load_at(machine, CODE_BASE, instrs);
    machine.set_entry(CODE_BASE);
}

/// Place code at an arbitrary base without touching the entry point.
pub fn load_at(machine: &mut Machine, base: u32, instrs: &[Instr]) {
    machine.load_raw(base, &assemble(instrs)).unwrap();
}
