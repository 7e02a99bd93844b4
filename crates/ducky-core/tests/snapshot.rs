mod common;

use common::*;
use ducky_core::cpu::insn::{Instr, Operand};
use ducky_core::snapshot::SnapshotImage;
use ducky_core::{Exit, Machine};

fn counting_program() -> Vec<Instr> {
    vec![
        Instr::Li { r: 2, imm: 0 },
        Instr::Inc { r: 2 },
        Instr::Cmp {
            r: 2,
            op: Operand::Imm(300),
        },
        Instr::Bne { offset: -3 },
        Instr::Hlt {
            code: Operand::Imm(7),
        },
    ]
}

#[test]
fn snapshot_restore_matches_uninterrupted_run() {
    let mut original = machine("");
    load_program(&mut original, &counting_program());

    // Run partway, snapshot through the serialized form.
    assert_eq!(original.step_rounds(50).unwrap(), None);
    let bytes = original.snapshot().to_bytes().unwrap();
    let image = SnapshotImage::from_bytes(&bytes).unwrap();

    let mut restored = machine("");
    restored.restore(image).unwrap();

    assert_eq!(original.run().unwrap(), Exit::Halted(7));
    assert_eq!(restored.run().unwrap(), Exit::Halted(7));

    assert_eq!(original.cores[0].regs, restored.cores[0].regs);
    assert_eq!(original.cores[0].ip, restored.cores[0].ip);
    assert_eq!(original.mem, restored.mem);
    assert_eq!(original.instructions(), restored.instructions());
}

#[test]
fn snapshot_device_writes_image_at_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("machine.snap");
    let extra = format!(
        "[device-0]\nklass = \"snapshot\"\ndriver = \"snapshot\"\nmmio-base = 0x9300\nfilepath = {:?}\n",
        path
    );
    let mut machine = machine(&extra);
    load_program(
        &mut machine,
        &[
            Instr::Li { r: 8, imm: 0x9300 },
            Instr::Li { r: 9, imm: 1 },
            Instr::Stw {
                r: 9,
                base: 8,
                disp: 0,
            },
            Instr::Hlt {
                code: Operand::Imm(0),
            },
        ],
    );
    assert_eq!(machine.run().unwrap(), Exit::Halted(0));

    let image = SnapshotImage::read_file(&path).unwrap();
    let extra = format!(
        "[device-0]\nklass = \"snapshot\"\ndriver = \"snapshot\"\nmmio-base = 0x9300\nfilepath = {:?}\n",
        dir.path().join("other.snap")
    );
    let mut fresh = common::machine(&extra);
    fresh.restore(image).unwrap();
    assert_eq!(fresh.cores[0].regs.read(8), 0x9300);
    assert_eq!(fresh.cores[0].regs.read(9), 1);
}

#[test]
fn restore_rejects_core_count_mismatch() {
    let mut single = machine("");
    load_program(&mut single, &counting_program());
    let image = single.snapshot();

    let text = "[machine]\ncores = 2\n\n[memory]\nsize = 65536\n";
    let config = ducky_core::config::Config::parse(text).unwrap();
    let mut dual = Machine::new(config).unwrap();
    assert!(dual.restore(image).is_err());
}
