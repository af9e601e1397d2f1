//! Harness configuration.
//!
//! Parses `bootprobe.toml` from the project root, applies the selected
//! `[targets.<name>]` override and the command-line toggles, and produces a
//! [`HarnessConfig`] with every path made absolute. The result is built once
//! at startup and passed by reference to each pipeline stage.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::build::BuildConfig;
use crate::launch::{ExitDevice, LaunchConfig};
use crate::verify::Check;

/// Name of the configuration file searched for in parent directories.
pub const CONFIG_FILE: &str = "bootprobe.toml";

/// Top-level layout of `bootprobe.toml`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub project: ProjectMeta,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub bootloader: BootloaderSection,
    #[serde(default)]
    pub media: MediaSection,
    #[serde(default)]
    pub qemu: QemuSection,
    #[serde(default)]
    pub debug: DebugSection,
    #[serde(default)]
    pub logs: LogsSection,
    #[serde(default)]
    pub verify: VerifySection,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetOverride>,
}

/// `[project]`.
#[derive(Debug, Deserialize)]
pub struct ProjectMeta {
    pub name: String,
}

/// `[build]`: how the kernel is compiled.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BuildSection {
    pub toolchain: String,
    /// Directory the toolchain runs in, relative to the project root.
    pub dir: String,
    pub package: String,
    /// File name of the produced binary.
    pub binary: String,
    pub target: String,
    pub features: Vec<String>,
    pub release: bool,
    pub build_std: bool,
    /// Cargo target directory, relative to `dir`.
    pub target_dir: String,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            toolchain: "cargo".into(),
            dir: "kernel".into(),
            package: "kernel".into(),
            binary: "kernel".into(),
            target: "x86_64-unknown-none".into(),
            features: Vec::new(),
            release: false,
            build_std: false,
            target_dir: "target".into(),
        }
    }
}

/// `[bootloader]`: either a prebuilt EFI image or a package built like the kernel.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BootloaderSection {
    pub prebuilt: Option<String>,
    pub dir: String,
    pub package: String,
    pub binary: String,
    pub target: String,
}

impl Default for BootloaderSection {
    fn default() -> Self {
        Self {
            prebuilt: None,
            dir: "bootloader".into(),
            package: "bootloader".into(),
            binary: "bootloader.efi".into(),
            target: "x86_64-unknown-uefi".into(),
        }
    }
}

/// `[media]`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MediaSection {
    pub dir: String,
}

impl Default for MediaSection {
    fn default() -> Self {
        Self { dir: "esp".into() }
    }
}

/// `[qemu]`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QemuSection {
    pub binary: String,
    /// Value of `-name`; also how stale instances are recognized.
    pub signature: Option<String>,
    pub machine: Option<String>,
    pub memory: String,
    pub firmware: String,
    pub exit_device: Option<ExitDevice>,
    pub display: bool,
    pub extra_args: Vec<String>,
    pub startup_grace_ms: u64,
}

impl Default for QemuSection {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".into(),
            signature: None,
            machine: Some("q35".into()),
            memory: "4G".into(),
            firmware: "/usr/share/OVMF/OVMF_CODE.fd".into(),
            exit_device: Some(ExitDevice::default()),
            display: false,
            extra_args: Vec::new(),
            startup_grace_ms: 500,
        }
    }
}

/// `[debug]`: the two independent debug toggles and the stub endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DebugSection {
    pub gdb: bool,
    pub wait: bool,
    pub trace: bool,
    pub host: String,
    pub port: u16,
    pub trace_events: String,
}

impl Default for DebugSection {
    fn default() -> Self {
        Self {
            gdb: false,
            wait: false,
            trace: false,
            host: "127.0.0.1".into(),
            port: 1234,
            trace_events: "int,cpu_reset".into(),
        }
    }
}

/// `[logs]`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LogsSection {
    pub dir: String,
    pub serial: String,
    pub trace: String,
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            dir: "logs".into(),
            serial: "serial.log".into(),
            trace: "qemu.log".into(),
        }
    }
}

/// `[verify]`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VerifySection {
    pub timeout: u64,
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
    /// How long a timed-out target may take to answer the break request.
    pub interrupt_grace_ms: u64,
    pub checks: Vec<CheckEntry>,
}

impl Default for VerifySection {
    fn default() -> Self {
        Self {
            timeout: 30,
            connect_attempts: 8,
            connect_backoff_ms: 100,
            interrupt_grace_ms: 5000,
            checks: vec![CheckEntry {
                symbol: "boot_complete".into(),
                sentinel: "BOOT_COMPLETE".into(),
            }],
        }
    }
}

/// `[[verify.checks]]`.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckEntry {
    pub symbol: String,
    pub sentinel: String,
}

/// `[targets.<name>]`: differences between kernel artifacts made explicit.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TargetOverride {
    pub package: Option<String>,
    pub binary: Option<String>,
    pub features: Option<Vec<String>>,
    pub machine: Option<String>,
    pub exit_device: Option<ExitDevice>,
    pub memory: Option<String>,
    pub extra_args: Option<Vec<String>>,
    pub checks: Option<Vec<CheckEntry>>,
}

/// Recognized command-line toggles, applied on top of the file.
#[derive(Debug, Clone, Default)]
pub struct Toggles {
    pub gdb: bool,
    pub wait_gdb: bool,
    pub trace: bool,
    pub features: Vec<String>,
    pub release: bool,
}

/// Where the bootloader image comes from.
#[derive(Debug, Clone)]
pub enum BootloaderSource {
    Prebuilt(PathBuf),
    Build(BuildConfig),
}

impl BootloaderSource {
    /// The path the image is (or will be) found at.
    pub fn image_path(&self) -> PathBuf {
        match self {
            Self::Prebuilt(path) => path.clone(),
            Self::Build(cfg) => cfg.artifact_path(),
        }
    }
}

/// Verification parameters.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    pub interrupt_grace: Duration,
    pub checks: Vec<Check>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub name: String,
    pub root: PathBuf,
    pub profile: Option<String>,
    pub kernel: BuildConfig,
    pub bootloader: BootloaderSource,
    pub media_dir: PathBuf,
    pub launch: LaunchConfig,
    pub verify: VerifyConfig,
}

/// Find the project root by looking for `bootprobe.toml` upwards from `start`.
pub fn find_project_root(start: &Path) -> Result<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(CONFIG_FILE).is_file() {
            return Ok(dir);
        }
        if !dir.pop() {
            bail!("could not find {CONFIG_FILE} in {} or any parent directory", start.display());
        }
    }
}

/// Load `bootprobe.toml` under `root` and resolve it.
pub fn load(root: &Path, profile: Option<&str>, toggles: &Toggles) -> Result<HarnessConfig> {
    let path = root.join(CONFIG_FILE);
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let project: ProjectConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
    resolve(project, root, profile, toggles)
}

/// Apply the profile override and toggles, and make paths absolute.
pub fn resolve(
    mut project: ProjectConfig,
    root: &Path,
    profile: Option<&str>,
    toggles: &Toggles,
) -> Result<HarnessConfig> {
    let over = match profile {
        Some(name) => project
            .targets
            .remove(name)
            .with_context(|| format!("target profile '{name}' not found in {CONFIG_FILE}"))?,
        None => TargetOverride::default(),
    };

    let build = &project.build;
    let kernel_dir = root.join(&build.dir);
    let mut features: BTreeSet<String> =
        over.features.unwrap_or_else(|| build.features.clone()).into_iter().collect();
    features.extend(toggles.features.iter().filter(|f| !f.is_empty()).cloned());

    let kernel = BuildConfig {
        toolchain: build.toolchain.clone(),
        target_dir: kernel_dir.join(&build.target_dir),
        dir: kernel_dir,
        package: over.package.unwrap_or_else(|| build.package.clone()),
        binary: over.binary.unwrap_or_else(|| build.binary.clone()),
        target: build.target.clone(),
        features,
        release: build.release || toggles.release,
        build_std: build.build_std,
    };

    let bl = &project.bootloader;
    let bootloader = match &bl.prebuilt {
        Some(path) => BootloaderSource::Prebuilt(root.join(path)),
        None => {
            let dir = root.join(&bl.dir);
            BootloaderSource::Build(BuildConfig {
                toolchain: build.toolchain.clone(),
                target_dir: dir.join(&build.target_dir),
                dir,
                package: bl.package.clone(),
                binary: bl.binary.clone(),
                target: bl.target.clone(),
                features: BTreeSet::new(),
                release: kernel.release,
                build_std: false,
            })
        }
    };

    let qemu = &project.qemu;
    let debug = &project.debug;
    let logs_dir = root.join(&project.logs.dir);
    let mut extra_args = qemu.extra_args.clone();
    extra_args.extend(over.extra_args.unwrap_or_default());

    let launch = LaunchConfig {
        emulator: qemu.binary.clone(),
        signature: qemu
            .signature
            .clone()
            .unwrap_or_else(|| format!("bootprobe-{}", project.project.name)),
        machine: over.machine.or_else(|| qemu.machine.clone()),
        memory: over.memory.unwrap_or_else(|| qemu.memory.clone()),
        firmware: root.join(&qemu.firmware),
        exit_device: over
            .exit_device
            .or(qemu.exit_device)
            .filter(|dev| dev.enabled),
        display: qemu.display,
        gdb_stub: debug.gdb || toggles.gdb || toggles.wait_gdb,
        wait_for_attach: debug.wait || toggles.wait_gdb,
        gdb_port: debug.port,
        trace: debug.trace || toggles.trace,
        trace_events: debug.trace_events.clone(),
        serial_log: logs_dir.join(&project.logs.serial),
        trace_log: logs_dir.join(&project.logs.trace),
        stderr_log: logs_dir.join("qemu.stderr.log"),
        pid_marker: logs_dir.join("qemu.pid"),
        extra_args,
        startup_grace: Duration::from_millis(qemu.startup_grace_ms),
    };

    let checks = over
        .checks
        .unwrap_or_else(|| project.verify.checks.clone())
        .into_iter()
        .map(|c| Check::new(c.symbol, c.sentinel))
        .collect();

    let verify = VerifyConfig {
        endpoint: format!("{}:{}", debug.host, debug.port),
        timeout: Duration::from_secs(project.verify.timeout),
        connect_attempts: project.verify.connect_attempts.max(1),
        connect_backoff: Duration::from_millis(project.verify.connect_backoff_ms),
        interrupt_grace: Duration::from_millis(project.verify.interrupt_grace_ms),
        checks,
    };

    Ok(HarnessConfig {
        name: project.project.name,
        root: root.to_path_buf(),
        profile: profile.map(String::from),
        kernel,
        bootloader,
        media_dir: root.join(&project.media.dir),
        launch,
        verify,
    })
}

/// Print the resolved configuration.
pub fn print_resolved(config: &HarnessConfig) {
    let kernel = &config.kernel;
    let launch = &config.launch;
    println!("Project: {} ({})", config.name, config.root.display());
    if let Some(profile) = &config.profile {
        println!("Target profile: {profile}");
    }
    println!("Kernel:");
    println!("  package:  {} ({})", kernel.package, kernel.target);
    println!("  artifact: {}", kernel.artifact_path().display());
    let features: Vec<&str> = kernel.features.iter().map(String::as_str).collect();
    println!("  features: [{}]", features.join(", "));
    println!("Bootloader: {}", config.bootloader.image_path().display());
    println!("Media: {}", config.media_dir.display());
    println!("QEMU:");
    println!("  binary:   {}", launch.emulator);
    println!("  machine:  {}", launch.machine.as_deref().unwrap_or("(default)"));
    println!("  memory:   {}", launch.memory);
    println!("  firmware: {}", launch.firmware.display());
    match launch.exit_device {
        Some(dev) => println!("  exit dev: iobase={:#x} iosize={:#x}", dev.iobase, dev.iosize),
        None => println!("  exit dev: none"),
    }
    println!(
        "  gdb stub: {} (wait: {}, port {})",
        launch.gdb_stub, launch.wait_for_attach, launch.gdb_port
    );
    println!("  trace:    {} ({})", launch.trace, launch.trace_log.display());
    println!("  serial:   {}", launch.serial_log.display());
    println!("Verify (timeout {:?}):", config.verify.timeout);
    for check in &config.verify.checks {
        println!("  {} -> {}", check.symbol, check.sentinel);
    }
}
