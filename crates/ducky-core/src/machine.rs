//! The machine: owns cores, memory, bus and devices, runs the boot sequence
//! and the cooperative scheduling loop.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use crate::binfmt::Binary;
use crate::bus::{Bus, DeviceCtx};
use crate::config::Config;
use crate::cpu::{Core, CoreParams, StepOutcome, System};
use crate::devices::{
    self, CaptureBuffer, InputSource, Keyboard, OutputSink, SnapshotDevice, StdinReader, Svga,
    Terminal, Tty,
};
use crate::hdt::HdtBuilder;
use crate::interrupt::InterruptController;
use crate::mem::{MemoryController, PageFlags, PAGE_SIZE};
use crate::snapshot::{DeviceState, SnapshotImage};
use crate::trap::VmError;

/// Per-core boot stack: four pages carved from the top of RAM.
pub const STACK_SIZE: u32 = 4 * PAGE_SIZE;

/// IVT region allocated at boot so guests can install handlers right away.
const IVT_REGION_SIZE: u32 = 0x100;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// `HLT 0` on every core, or `HLT n` anywhere.
    Halted(u32),
    /// Instruction or wall-clock budget exceeded.
    Timeout,
}

/// Host-side knobs that are not part of the guest-visible configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct MachineOptions {
    /// Bind console devices to the host terminal.
    pub interactive: bool,
    /// Keep a copy of guest console output.
    pub capture: bool,
    /// Count executed instructions per opcode.
    pub profile: bool,
}

#[derive(Debug)]
pub struct Machine {
    config: Config,
    options: MachineOptions,
    pub cores: Vec<Core>,
    pub mem: MemoryController,
    pub bus: Bus,
    pub intc: InterruptController,
    clock: u64,
    instructions: u64,
    hdt_base: u32,
    entry: Option<u32>,
    capture: Option<CaptureBuffer>,
    snapshot_devices: Vec<usize>,
}

impl Machine {
    pub fn new(config: Config) -> Result<Self, VmError> {
        Machine::with_options(config, MachineOptions::default())
    }

    /// Construct and boot a machine: devices, loaded binaries, HDT, core
    /// init. The run loop is started separately.
    pub fn with_options(config: Config, options: MachineOptions) -> Result<Self, VmError> {
        let ncores = config.core_count();
        let mut mem =
            MemoryController::new(config.memory.size, !config.memory.force_aligned_access);
        let mut bus = Bus::new();
        let intc = InterruptController::new(ncores);

        // Devices first, so the HDT can describe them.
        let mut snapshot_devices = Vec::new();
        for section in &config.devices {
            let setup = devices::construct(section)?;
            let index = bus.register(setup.device, setup.mmio, setup.ports)?;
            if bus.devices()[index].class() == "snapshot" {
                snapshot_devices.push(index);
            }
        }

        let capture = options.capture.then(|| Rc::new(RefCell::new(Vec::new())));
        wire_console(&mut bus, &options, capture.clone())?;

        // Boot images.
        let mut entry = None;
        if let Some(bootloader) = &config.bootloader {
            let binary = Binary::read_file(&bootloader.file)?;
            binary.load(&mut mem)?;
            entry = Some(binary.entry(None)?);
        }
        for section in &config.binaries {
            let binary = Binary::read_file(&section.file)?;
            binary.load(&mut mem)?;
            if entry.is_none() {
                entry = Some(binary.entry(section.entry.as_deref())?);
            }
        }

        // IVT region, zeroed: every vector starts absent.
        mem.alloc_region(0, IVT_REGION_SIZE, PageFlags::rw(), None)?;

        // HDT blob.
        let hdt_base = config.machine.hdt_address;
        let blob = build_hdt(&config, &bus);
        mem.alloc_region(hdt_base, blob.len() as u32, PageFlags::rw(), None)?;
        mem.host_write(hdt_base, &blob)?;

        // Boot stacks, one per core, owned by their core.
        let stacks = ncores as u32 * STACK_SIZE;
        if stacks >= config.memory.size {
            return Err(VmError::Configuration(format!(
                "memory size {:#x} cannot hold {ncores} boot stacks",
                config.memory.size
            )));
        }
        for id in 0..ncores {
            let top = stack_top(config.memory.size, id);
            mem.alloc_region(top - STACK_SIZE, STACK_SIZE, PageFlags::rw(), Some(id))?;
        }

        let params = CoreParams {
            tlb_capacity: config.cpu.tlb,
            icache_capacity: config.cpu.instr_cache,
            math_coprocessor: config.cpu.math_coprocessor,
            check_frames: config.cpu.check_frames,
        };
        let mut cores = Vec::with_capacity(ncores);
        for id in 0..ncores {
            let mut core = Core::new(id, params);
            core.count_insts = options.profile;
            core.init_boot(
                entry.unwrap_or(0),
                stack_top(config.memory.size, id),
                hdt_base,
            );
            cores.push(core);
        }

        if entry.is_none() {
            tracing::warn!("no bootloader or binary configured, entry defaults to 0");
        }

        tracing::info!(
            cores = ncores,
            memory = config.memory.size,
            devices = bus.devices().len(),
            "machine constructed"
        );

        Ok(Machine {
            config,
            options,
            cores,
            mem,
            bus,
            intc,
            clock: 0,
            instructions: 0,
            hdt_base,
            entry,
            capture,
            snapshot_devices,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    pub fn hdt_base(&self) -> u32 {
        self.hdt_base
    }

    /// Captured console output, when the machine was built with capture on.
    pub fn captured_output(&self) -> Option<Vec<u8>> {
        self.capture.as_ref().map(|buffer| buffer.borrow().clone())
    }

    /// Load an additional binary (the `--machine-in` path). The first image
    /// that provides an entry point wins.
    pub fn load_binary(&mut self, binary: &Binary) -> Result<(), VmError> {
        binary.load(&mut self.mem)?;
        if self.entry.is_none() {
            let entry = binary.entry(None)?;
            self.set_entry(entry);
        }
        Ok(())
    }

    /// Place raw bytes as read-write-execute memory. Test harness and
    /// bootstrap helper.
    pub fn load_raw(&mut self, base: u32, bytes: &[u8]) -> Result<(), VmError> {
        self.mem
            .alloc_region(base, bytes.len() as u32, PageFlags::rwx(), None)?;
        self.mem.host_write(base, bytes)
    }

    /// Re-point every core's boot entry and reset it.
    pub fn set_entry(&mut self, entry: u32) {
        self.entry = Some(entry);
        let size = self.config.memory.size;
        let hdt = self.hdt_base;
        for core in &mut self.cores {
            let top = stack_top(size, core.id);
            core.init_boot(entry, top, hdt);
        }
    }

    /// Borrow a device by instance name, downcast to its concrete type.
    pub fn device_downcast_mut<T: 'static>(&mut self, name: &str) -> Option<&mut T> {
        let index = self.bus.find(name)?;
        self.bus.device_mut(index).as_any_mut().downcast_mut::<T>()
    }

    /// One scheduler round: each core advances one instruction, then the
    /// devices run their timed logic, then deferred snapshot requests are
    /// honored.
    pub fn tick(&mut self) -> Result<Option<Exit>, VmError> {
        let ncores = self.cores.len();
        let mut executed = false;
        for index in 0..ncores {
            let core = &mut self.cores[index];
            let mut sys = System {
                mem: &mut self.mem,
                bus: &mut self.bus,
                intc: &mut self.intc,
                clock: self.clock,
                ncores,
            };
            match core.step(&mut sys)? {
                StepOutcome::Executed => {
                    self.instructions += 1;
                    self.clock += 1;
                    executed = true;
                }
                StepOutcome::Parked => {}
                StepOutcome::HaltMachine(code) => return Ok(Some(Exit::Halted(code))),
            }
        }
        if !executed {
            // Virtual time keeps flowing while every core waits, otherwise
            // timed devices could never wake an idle machine.
            self.clock += 1;
        }

        let mut ctx = DeviceCtx {
            mem: &mut self.mem,
            intc: &mut self.intc,
            clock: self.clock,
        };
        self.bus.tick_all(&mut ctx)?;

        self.service_snapshot_requests()?;

        if self.cores.iter().all(|core| core.flags.halted) {
            return Ok(Some(Exit::Halted(0)));
        }
        Ok(None)
    }

    /// Run a bounded number of rounds; test harness helper.
    pub fn step_rounds(&mut self, rounds: u64) -> Result<Option<Exit>, VmError> {
        for _ in 0..rounds {
            if let Some(exit) = self.tick()? {
                return Ok(Some(exit));
            }
        }
        Ok(None)
    }

    /// Run until halt, fatal fault or budget exhaustion.
    pub fn run(&mut self) -> Result<Exit, VmError> {
        let started = Instant::now();
        let max_instructions = self.config.machine.max_instructions;
        let max_seconds = self.config.machine.max_seconds;
        loop {
            if let Some(exit) = self.tick()? {
                tracing::info!(?exit, instructions = self.instructions, "machine stopped");
                return Ok(exit);
            }
            if max_instructions > 0 && self.instructions >= max_instructions {
                tracing::warn!(budget = max_instructions, "instruction budget exceeded");
                return Ok(Exit::Timeout);
            }
            if max_seconds > 0 && started.elapsed().as_secs() >= max_seconds {
                tracing::warn!(budget = max_seconds, "wall-clock budget exceeded");
                return Ok(Exit::Timeout);
            }
        }
    }

    fn service_snapshot_requests(&mut self) -> Result<(), VmError> {
        for index in self.snapshot_devices.clone() {
            let requested_path = {
                let device = self.bus.device_mut(index);
                let snapshot = device
                    .as_any_mut()
                    .downcast_mut::<SnapshotDevice>()
                    .ok_or_else(|| VmError::Invariant("snapshot device lost".into()))?;
                snapshot.take_request().then(|| snapshot.path().clone())
            };
            if let Some(path) = requested_path {
                tracing::info!(path = %path.display(), "snapshot requested");
                self.snapshot().write_file(&path)?;
            }
        }
        Ok(())
    }

    /// Capture the observable machine state.
    pub fn snapshot(&self) -> SnapshotImage {
        SnapshotImage {
            cores: self.cores.clone(),
            mem: self.mem.clone(),
            intc: self.intc.clone(),
            clock: self.clock,
            instructions: self.instructions,
            devices: self
                .bus
                .devices()
                .iter()
                .map(|device| DeviceState {
                    class: device.class().to_string(),
                    name: device.name().to_string(),
                    data: device.save_state(),
                })
                .collect(),
        }
    }

    /// Restore a snapshot into a machine built from the same configuration.
    pub fn restore(&mut self, image: SnapshotImage) -> Result<(), VmError> {
        if image.cores.len() != self.cores.len() {
            return Err(VmError::Invariant(format!(
                "snapshot has {} cores, machine has {}",
                image.cores.len(),
                self.cores.len()
            )));
        }
        self.cores = image.cores;
        for core in &mut self.cores {
            core.count_insts = self.options.profile;
        }
        self.mem = image.mem;
        self.intc = image.intc;
        self.clock = image.clock;
        self.instructions = image.instructions;
        for state in &image.devices {
            let index = self.bus.find(&state.name).ok_or_else(|| {
                VmError::Invariant(format!("snapshot device {} not configured", state.name))
            })?;
            self.bus.device_mut(index).restore_state(&state.data)?;
        }
        tracing::info!(instructions = self.instructions, "snapshot restored");
        Ok(())
    }

    pub fn restore_file(&mut self, path: &Path) -> Result<(), VmError> {
        self.restore(SnapshotImage::read_file(path)?)
    }

    /// Aggregated per-opcode execution counts across cores.
    pub fn profile(&self) -> BTreeMap<&'static str, u64> {
        let mut total = BTreeMap::new();
        for core in &self.cores {
            for (mnemonic, count) in &core.inst_counter {
                *total.entry(*mnemonic).or_insert(0) += count;
            }
        }
        total
    }
}

fn stack_top(memory_size: u32, core: usize) -> u32 {
    memory_size - core as u32 * STACK_SIZE
}

fn build_hdt(config: &Config, bus: &Bus) -> Vec<u8> {
    let mut builder = HdtBuilder::new();
    builder.cpu(
        config.machine.cpus as u16,
        config.machine.cores as u16,
    );
    builder.memory(config.memory.size);
    for (index, device) in bus.devices().iter().enumerate() {
        builder.device(&device.info(), bus.region_of(index), device.irq());
    }
    builder.build()
}

/// Bind console devices to the host terminal per the terminal sections:
/// the named keyboard gets host stdin, the named tty gets host stdout. The
/// bindings are validated; naming a missing or mistyped instance is a
/// configuration error.
fn wire_console(
    bus: &mut Bus,
    options: &MachineOptions,
    capture: Option<CaptureBuffer>,
) -> Result<(), VmError> {
    let tty_sink = || match (options.interactive, &capture) {
        (true, Some(buffer)) => OutputSink::StdoutCapture(buffer.clone()),
        (true, None) => OutputSink::Stdout,
        (false, Some(buffer)) => OutputSink::Capture(buffer.clone()),
        (false, None) => OutputSink::Null,
    };

    let mut terminals = Vec::new();
    for index in 0..bus.devices().len() {
        let device = bus.device_mut(index);
        if let Some(terminal) = device.as_any_mut().downcast_mut::<Terminal>() {
            terminals.push((index, terminal.input.clone(), terminal.output.clone()));
            terminal.set_sink(tty_sink());
            continue;
        }
        if let Some(tty) = device.as_any_mut().downcast_mut::<Tty>() {
            tty.set_sink(tty_sink());
            continue;
        }
        if !options.interactive {
            if let Some(svga) = device.as_any_mut().downcast_mut::<Svga>() {
                svga.set_sink(OutputSink::Null);
            }
        }
    }

    for (terminal_index, input, output) in terminals {
        // The output binding is validated even though every tty already got
        // its sink above.
        if let Some(name) = &output {
            let index = bus.find(name).ok_or_else(|| {
                VmError::Configuration(format!("terminal output {name:?} not found"))
            })?;
            if bus
                .device_mut(index)
                .as_any_mut()
                .downcast_mut::<Tty>()
                .is_none()
            {
                return Err(VmError::Configuration(format!(
                    "terminal output {name:?} is not a tty"
                )));
            }
        }
        match input {
            Some(name) => {
                let index = bus.find(&name).ok_or_else(|| {
                    VmError::Configuration(format!("terminal input {name:?} not found"))
                })?;
                let keyboard = bus
                    .device_mut(index)
                    .as_any_mut()
                    .downcast_mut::<Keyboard>()
                    .ok_or_else(|| {
                        VmError::Configuration(format!("terminal input {name:?} is not a keyboard"))
                    })?;
                if options.interactive {
                    keyboard.set_source(InputSource::Stdin(StdinReader::new()));
                }
            }
            None => {
                if options.interactive {
                    let terminal = bus
                        .device_mut(terminal_index)
                        .as_any_mut()
                        .downcast_mut::<Terminal>()
                        .expect("terminal index");
                    terminal.set_source(InputSource::Stdin(StdinReader::new()));
                }
            }
        }
    }
    Ok(())
}
