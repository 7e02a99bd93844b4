//! holding command related structures
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[clap(name = "ducky-vm", bin_name = "ducky-vm")]
#[clap(version, about = "Runner for the Ducky 32-bit virtual machine")]
pub struct Cli {
    /// Machine configuration file
    pub config: PathBuf,

    /// Additional binary loaded into the booted machine (repeatable)
    #[clap(long = "machine-in", value_name = "FILE")]
    pub machine_in: Vec<PathBuf>,

    /// Write a machine snapshot to FILE on halt
    #[clap(long = "machine-out", value_name = "FILE")]
    pub machine_out: Option<PathBuf>,

    /// Restore machine state from a snapshot before running
    #[clap(long, value_name = "FILE")]
    pub restore: Option<PathBuf>,

    /// Configuration override (repeatable)
    #[clap(long = "set", value_name = "SECTION:KEY=VALUE")]
    pub set: Vec<String>,

    /// Force debug-level tracing
    #[clap(long)]
    pub debug: bool,

    /// Dump per-opcode execution counters at exit
    #[clap(long)]
    pub profile: bool,

    /// Capture guest console output and echo it after the run
    #[clap(short = 'g', long = "guest-output")]
    pub guest_output: bool,
}
