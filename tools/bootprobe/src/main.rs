//! bootprobe: kernel boot-and-verification harness.
//!
//! Pipeline: build bootloader and kernel → assemble the EFI boot media →
//! launch QEMU detached → attach to its GDB stub once per check → break on
//! the check's symbol → emit a sentinel line when it is reached.
//!
//! Every failure maps to a distinct exit status (see [`error`]).

mod build;
mod cli;
mod config;
mod controller;
mod error;
mod launch;
mod logs;
mod media;
mod rsp;
mod symbols;
mod verbose;
mod verify;

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::build::BuildArtifact;
use crate::config::{BootloaderSource, HarnessConfig, Toggles};
use crate::controller::BreakpointEvent;
use crate::error::{BuildError, EXIT_OTHER, HarnessError};
use crate::launch::{EmulatorProcess, ExitDevice, ExitPolicy};
use crate::media::BootMedia;
use crate::symbols::SymbolTable;
use crate::verbose::{StageTimer, dprintln, vprintln};

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    verbose::init(cli.quiet, cli.verbose);

    match dispatch(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<HarnessError>()
                .map_or(EXIT_OTHER, HarnessError::exit_code);
            ExitCode::from(code)
        }
    }
}

fn dispatch(cli: &cli::Cli) -> Result<()> {
    match &cli.command {
        cli::Command::Build(args) => cmd_build(cli, &args.toggles.toggles()),
        cli::Command::Assemble(args) => cmd_assemble(cli, args),
        cli::Command::Run(args) => cmd_run(cli, args),
        cli::Command::Verify(args) => cmd_verify(cli, args),
        cli::Command::Attach(args) => cmd_attach(cli, args),
        cli::Command::Stop => cmd_stop(cli),
        cli::Command::Config(args) => cmd_config(cli, &args.toggles()),
    }
}

// ===========================================================================
// Configuration
// ===========================================================================

fn load_config(cli: &cli::Cli, toggles: &Toggles) -> Result<HarnessConfig> {
    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    let root = config::find_project_root(&cwd)?;
    config::load(&root, cli.profile.as_deref(), toggles)
}

fn override_checks(config: &mut HarnessConfig, checks: &[verify::Check], timeout: Option<u64>) {
    if !checks.is_empty() {
        config.verify.checks = checks.to_vec();
    }
    if let Some(secs) = timeout {
        config.verify.timeout = Duration::from_secs(secs);
    }
}

// ===========================================================================
// Pipeline stages
// ===========================================================================

fn build_bootloader(config: &HarnessConfig) -> Result<PathBuf, HarnessError> {
    match &config.bootloader {
        BootloaderSource::Prebuilt(path) => Ok(path.clone()),
        BootloaderSource::Build(bl) => {
            let _t = StageTimer::start("bootloader build");
            build::build_binary(bl)
        }
    }
}

fn build_all(config: &HarnessConfig) -> Result<(PathBuf, BuildArtifact), HarnessError> {
    let bootloader = build_bootloader(config)?;
    let _t = StageTimer::start("kernel build");
    let kernel = build::build_kernel(&config.kernel)?;
    Ok((bootloader, kernel))
}

fn assemble(config: &HarnessConfig, bootloader: &Path, kernel: &Path) -> Result<BootMedia, HarnessError> {
    let _t = StageTimer::start("media assembly");
    let media = BootMedia::assemble(&config.media_dir, bootloader, kernel)?;
    if verbose::is_verbose() {
        match media.digest() {
            Ok(digest) => vprintln!("  media digest: {digest}"),
            Err(e) => vprintln!("  media digest unavailable: {e}"),
        }
    }
    Ok(media)
}

fn load_symbols(config: &HarnessConfig, kernel: &Path) -> Result<SymbolTable, HarnessError> {
    SymbolTable::load(kernel).map_err(|reason| HarnessError::BuildFailure {
        package: config.kernel.package.clone(),
        source: BuildError::Symbols {
            path: kernel.to_path_buf(),
            reason,
        },
    })
}

fn launch(config: &HarnessConfig, media: &BootMedia) -> Result<EmulatorProcess, HarnessError> {
    let _t = StageTimer::start("launch");
    launch::launch(&config.launch, media)
}

fn report_events(events: &[BreakpointEvent], symbols: &SymbolTable) {
    for event in events {
        dprintln!(
            "  ok  {} -> {} at {} (hits: {})",
            event.symbol,
            event.sentinel,
            symbols.describe(event.address),
            event.hits
        );
    }
    println!("Verified {} check(s).", events.len());
}

/// Why the emulator went away, for a lost connection.
fn exit_note(emulator: &mut EmulatorProcess) -> Option<String> {
    let status = emulator.poll_exit()?;
    let guest = emulator
        .config()
        .exit_device
        .and_then(|_| ExitDevice::guest_code(status))
        .map(|code| format!(", guest exit code {code:#x}"))
        .unwrap_or_default();
    Some(format!(
        "emulator exited ({status}{guest}); see {}",
        emulator.logs().serial.display()
    ))
}

// ===========================================================================
// Commands
// ===========================================================================

fn cmd_build(cli: &cli::Cli, toggles: &Toggles) -> Result<()> {
    let config = load_config(cli, toggles)?;
    let (bootloader, kernel) = build_all(&config)?;
    println!("Bootloader: {}", bootloader.display());
    println!("Kernel:     {} ({} symbols)", kernel.binary.display(), kernel.symbols.len());
    Ok(())
}

fn cmd_assemble(cli: &cli::Cli, args: &cli::AssembleArgs) -> Result<()> {
    let config = load_config(cli, &args.toggles.toggles())?;
    let kernel = args
        .kernel
        .clone()
        .unwrap_or_else(|| config.kernel.artifact_path());
    let bootloader = args
        .bootloader
        .clone()
        .unwrap_or_else(|| config.bootloader.image_path());
    let media = assemble(&config, &bootloader, &kernel)?;
    println!("Boot media: {}", media.root().display());
    Ok(())
}

fn cmd_run(cli: &cli::Cli, args: &cli::RunArgs) -> Result<()> {
    let mut config = load_config(cli, &args.toggles.toggles())?;
    config.launch.extra_args.extend(args.extra_args.iter().cloned());

    let (bootloader, kernel) = build_all(&config)?;
    let media = assemble(&config, &bootloader, &kernel.binary)?;
    let emulator = launch(&config, &media)?;

    println!("QEMU running (pid {})", emulator.pid());
    println!("  serial log: {}", config.launch.serial_log.display());
    if config.launch.trace {
        println!("  trace log:  {}", config.launch.trace_log.display());
    }
    if config.launch.gdb_stub {
        let waiting = if config.launch.wait_for_attach { ", waiting for attach" } else { "" };
        println!("  gdb stub:   tcp::{}{waiting}", config.launch.gdb_port);
    }
    Ok(())
}

fn cmd_verify(cli: &cli::Cli, args: &cli::VerifyArgs) -> Result<()> {
    // Breakpoints must be in place before the first instruction runs.
    let toggles = Toggles {
        wait_gdb: true,
        ..args.toggles.toggles()
    };
    let mut config = load_config(cli, &toggles)?;
    override_checks(&mut config, &args.checks, args.timeout);

    let bootloader = if args.no_build {
        config.bootloader.image_path()
    } else {
        build_bootloader(&config)?
    };

    let (kernel, prebuilt_symbols) = match (&args.kernel, args.no_build) {
        (Some(path), _) => (path.clone(), None),
        (None, true) => (config.kernel.artifact_path(), None),
        (None, false) => {
            let _t = StageTimer::start("kernel build");
            let artifact = build::build_kernel(&config.kernel)?;
            (artifact.binary, Some(artifact.symbols))
        }
    };

    let media = assemble(&config, &bootloader, &kernel)?;
    let symbols = match prebuilt_symbols {
        Some(symbols) => symbols,
        None => load_symbols(&config, &kernel)?,
    };

    let mut emulator = launch(&config, &media)?;
    if args.terminate {
        emulator.set_exit_policy(ExitPolicy::Terminate);
    }

    let result = {
        let _t = StageTimer::start("verification");
        verify::verify_all(&symbols, &config.verify, || Box::new(io::stdout()))
    };
    let events = match result {
        Ok(events) => events,
        Err(err @ HarnessError::ConnectionLost(_)) => {
            return Err(match exit_note(&mut emulator) {
                Some(note) => anyhow::Error::new(err).context(note),
                None => err.into(),
            });
        }
        Err(err) => return Err(err.into()),
    };

    report_events(&events, &symbols);
    if !args.terminate {
        dprintln!(
            "QEMU left running (pid {}); `bootprobe stop` terminates it",
            emulator.pid()
        );
    }
    Ok(())
}

fn cmd_attach(cli: &cli::Cli, args: &cli::AttachArgs) -> Result<()> {
    let mut config = load_config(cli, &Toggles::default())?;
    override_checks(&mut config, &args.checks, args.timeout);

    let kernel = args
        .kernel
        .clone()
        .unwrap_or_else(|| config.kernel.artifact_path());
    let symbols = load_symbols(&config, &kernel)?;

    let events = verify::verify_all(&symbols, &config.verify, || Box::new(io::stdout()))?;
    report_events(&events, &symbols);
    Ok(())
}

fn cmd_stop(cli: &cli::Cli) -> Result<()> {
    let config = load_config(cli, &Toggles::default())?;
    match launch::stop_recorded(&config.launch).map_err(HarnessError::from)? {
        Some(pid) => println!("Terminated QEMU (pid {pid})"),
        None => println!("No running instance recorded"),
    }
    Ok(())
}

fn cmd_config(cli: &cli::Cli, toggles: &Toggles) -> Result<()> {
    let config = load_config(cli, toggles)?;
    config::print_resolved(&config);
    Ok(())
}
