//! ducky-vm cli
mod command;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing::error;

use command::Cli;
use ducky_core::binfmt::Binary;
use ducky_core::config::Config;
use ducky_core::machine::MachineOptions;
use ducky_core::{Exit, Machine, VmError};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.debug);

    match run(&cli) {
        Ok(Exit::Halted(code)) => ExitCode::from(code as u8),
        Ok(Exit::Timeout) => ExitCode::from(3),
        Err(err) => {
            error!("{err:#}");
            let code = match err.downcast_ref::<VmError>() {
                Some(
                    VmError::Configuration(_)
                    | VmError::BinaryFormat(_)
                    | VmError::DeviceInit(_)
                    | VmError::AddressConflict(..),
                ) => 2,
                _ => 1,
            };
            ExitCode::from(code)
        }
    }
}

/// Initialize the logger with a nice formatted output
fn init_logger(debug: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt::fmt().with_env_filter(filter).with_target(false).init();
}

fn run(cli: &Cli) -> Result<Exit> {
    let text = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;
    let config = Config::parse_with_overrides(&text, &cli.set)?;

    let options = MachineOptions {
        interactive: true,
        capture: cli.guest_output,
        profile: cli.profile,
    };
    let mut machine = Machine::with_options(config, options)?;

    for path in &cli.machine_in {
        let binary =
            Binary::read_file(path).with_context(|| format!("loading {}", path.display()))?;
        machine.load_binary(&binary)?;
    }
    if let Some(path) = &cli.restore {
        machine.restore_file(path)?;
    }

    let exit = machine.run()?;

    if let Some(path) = &cli.machine_out {
        machine.snapshot().write_file(path)?;
    }
    if cli.profile {
        print_profile(&machine);
    }
    if cli.guest_output {
        if let Some(bytes) = machine.captured_output() {
            println!("{}", "guest output:".bold());
            println!("{}", String::from_utf8_lossy(&bytes));
        }
    }

    Ok(exit)
}

fn print_profile(machine: &Machine) {
    let profile = machine.profile();
    if profile.is_empty() {
        return;
    }
    println!("{}", "instruction profile:".bold());
    let mut entries: Vec<_> = profile.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    for (mnemonic, count) in entries {
        println!("  {:>12}  {}", count.to_string().green(), mnemonic);
    }
}
