//! Command-line interface definitions for bootprobe.

use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};

use crate::config::Toggles;
use crate::verify::Check;

/// Build, boot and verify a kernel under QEMU.
#[derive(Parser)]
#[command(name = "bootprobe", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Target profile from `[targets.<name>]` in bootprobe.toml.
    #[arg(long, short = 'P', global = true)]
    pub profile: Option<String>,

    /// Only print errors, sentinels and the final result.
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Print command lines, protocol traffic and stage timings.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Build the bootloader and kernel.
    Build(BuildArgs),
    /// Assemble the boot media from existing artifacts.
    Assemble(AssembleArgs),
    /// Build, assemble and launch QEMU detached.
    Run(RunArgs),
    /// Full pipeline, then verify each check in its own debug session.
    Verify(VerifyArgs),
    /// Verify checks against an emulator that is already running.
    Attach(AttachArgs),
    /// Terminate the emulator recorded in the pid marker.
    Stop,
    /// Print the resolved configuration.
    Config(ToggleArgs),
}

/// Options that change what is built and how QEMU is started.
#[derive(Args, Clone, Default)]
pub struct ToggleArgs {
    /// Start QEMU's GDB stub.
    #[arg(long, env = "BOOTPROBE_GDB", value_parser = BoolishValueParser::new())]
    pub gdb: bool,

    /// Start the GDB stub and hold the CPU until a debugger attaches.
    #[arg(long, env = "BOOTPROBE_WAIT_GDB", value_parser = BoolishValueParser::new())]
    pub wait_gdb: bool,

    /// Log interrupts and CPU resets to the trace log.
    #[arg(long, env = "BOOTPROBE_TRACE", value_parser = BoolishValueParser::new())]
    pub trace: bool,

    /// Extra kernel features, comma separated.
    #[arg(long, env = "BOOTPROBE_FEATURES", value_delimiter = ',')]
    pub features: Vec<String>,

    /// Build in release mode.
    #[arg(long)]
    pub release: bool,
}

impl ToggleArgs {
    pub fn toggles(&self) -> Toggles {
        Toggles {
            gdb: self.gdb,
            wait_gdb: self.wait_gdb,
            trace: self.trace,
            features: self.features.clone(),
            release: self.release,
        }
    }
}

/// Arguments for the `build` subcommand.
#[derive(Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub toggles: ToggleArgs,
}

/// Arguments for the `assemble` subcommand.
#[derive(Args)]
pub struct AssembleArgs {
    /// Kernel binary (default: the configured build artifact).
    #[arg(long)]
    pub kernel: Option<PathBuf>,

    /// Bootloader image (default: the configured bootloader).
    #[arg(long)]
    pub bootloader: Option<PathBuf>,

    #[command(flatten)]
    pub toggles: ToggleArgs,
}

/// Arguments for the `run` subcommand.
#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub toggles: ToggleArgs,

    /// Extra arguments passed to QEMU after `--`.
    #[arg(last = true)]
    pub extra_args: Vec<String>,
}

/// Arguments for the `verify` subcommand.
#[derive(Args)]
pub struct VerifyArgs {
    /// Check to run, as SYMBOL=LABEL (repeatable; replaces the configured checks).
    #[arg(long = "check", value_name = "SYMBOL=LABEL")]
    pub checks: Vec<Check>,

    /// Seconds to wait for each symbol.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Skip the build and use existing artifacts.
    #[arg(long)]
    pub no_build: bool,

    /// Kernel binary to boot (implies `--no-build` for the kernel).
    #[arg(long)]
    pub kernel: Option<PathBuf>,

    /// Kill the emulator when verification ends.
    #[arg(long)]
    pub terminate: bool,

    #[command(flatten)]
    pub toggles: ToggleArgs,
}

/// Arguments for the `attach` subcommand.
#[derive(Args)]
pub struct AttachArgs {
    /// Check to run, as SYMBOL=LABEL (repeatable; replaces the configured checks).
    #[arg(long = "check", value_name = "SYMBOL=LABEL")]
    pub checks: Vec<Check>,

    /// Seconds to wait for each symbol.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Kernel binary to read symbols from (default: the configured artifact).
    #[arg(long)]
    pub kernel: Option<PathBuf>,
}
