mod common;

use common::*;
use ducky_core::hdt::{self, HdtEntry};

#[test]
fn guest_discovers_hardware_through_r0() {
    let extra = r#"
[device-0]
klass = "rtc"
driver = "rtc"
mmio-base = 0x9000
irq = 8
frequency = 100

[device-1]
klass = "keyboard"
driver = "keyboard"
mmio-base = 0x9100
irq = 9
"#;
    let machine = machine(extra);

    // Boot protocol: r0 carries the HDT base.
    let base = machine.cores[0].regs.read(0);
    assert_eq!(base, machine.hdt_base());
    assert_eq!(base, 0x100);

    let mut header = [0u8; 12];
    machine.mem.host_read(base, &mut header).unwrap();
    let total = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let mut blob = vec![0u8; total as usize];
    machine.mem.host_read(base, &mut blob).unwrap();

    let entries = hdt::parse(&blob).unwrap();
    assert_eq!(entries[0], HdtEntry::Cpu { cpus: 1, cores: 1 });
    assert_eq!(entries[1], HdtEntry::Memory { size: 65536 });

    // Device entries follow in configuration order.
    let devices: Vec<_> = entries
        .iter()
        .filter_map(|entry| match entry {
            HdtEntry::Device {
                ident,
                mmio_base,
                irq,
                ..
            } => Some((ident.as_str(), *mmio_base, *irq)),
            _ => None,
        })
        .collect();
    assert_eq!(
        devices,
        vec![
            ("ducky.rtc", 0x9000, Some(8)),
            ("ducky.input.keyboard", 0x9100, Some(9)),
        ]
    );
}

#[test]
fn hdt_reflects_core_count() {
    let machine = machine("[machine]\ncpus = 2\ncores = 2\n");
    let base = machine.hdt_base();
    let mut header = [0u8; 12];
    machine.mem.host_read(base, &mut header).unwrap();
    let total = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let mut blob = vec![0u8; total as usize];
    machine.mem.host_read(base, &mut blob).unwrap();

    let entries = hdt::parse(&blob).unwrap();
    assert_eq!(entries[0], HdtEntry::Cpu { cpus: 2, cores: 2 });
    // Every core got its own id in r1.
    for (id, core) in machine.cores.iter().enumerate() {
        assert_eq!(core.regs.read(1), id as u32);
    }
}
