//! QEMU launch and process lifecycle.
//!
//! The emulator runs detached in its own process group so it outlives the
//! verification session (and a Ctrl-C aimed at the harness). Each instance is
//! tagged with `-name <signature>` and recorded in a pid marker file; both are
//! used to find and kill leftovers from a previous run before a new one
//! starts.

use std::fs;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Deserialize;

use crate::error::{HarnessError, LaunchError};
use crate::logs::{self, LogFiles};
use crate::media::BootMedia;
use crate::verbose::{dprintln, vprintln, wprintln};

const STALE_EXIT_WAIT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// `isa-debug-exit` wiring: a one-byte port the guest writes its status to.
///
/// QEMU exits with `(value << 1) | 1` when the guest writes `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExitDevice {
    pub enabled: bool,
    pub iobase: u16,
    pub iosize: u16,
}

impl Default for ExitDevice {
    fn default() -> Self {
        Self {
            enabled: true,
            iobase: 0xf4,
            iosize: 0x04,
        }
    }
}

impl ExitDevice {
    /// The value the guest wrote, recovered from QEMU's exit code.
    pub fn guest_code(status: ExitStatus) -> Option<i32> {
        let code = status.code()?;
        (code & 1 == 1).then_some(code >> 1)
    }
}

/// Everything needed to compose one emulator command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub emulator: String,
    /// `-name` value; identifies instances started by this harness.
    pub signature: String,
    pub machine: Option<String>,
    pub memory: String,
    pub firmware: PathBuf,
    pub exit_device: Option<ExitDevice>,
    pub display: bool,
    /// Debug toggle (a): remote GDB stub.
    pub gdb_stub: bool,
    /// Hold the CPU at the first instruction until a debugger attaches.
    pub wait_for_attach: bool,
    pub gdb_port: u16,
    /// Debug toggle (b): QEMU's own interrupt/reset log.
    pub trace: bool,
    pub trace_events: String,
    pub serial_log: PathBuf,
    pub trace_log: PathBuf,
    pub stderr_log: PathBuf,
    pub pid_marker: PathBuf,
    pub extra_args: Vec<String>,
    /// How long a fresh process must survive to count as launched.
    pub startup_grace: Duration,
}

/// QEMU option values treat `,` as a separator; literal commas are doubled.
fn opt_path(path: &Path) -> String {
    path.display().to_string().replace(',', ",,")
}

impl LaunchConfig {
    /// The emulator argument vector for booting `media`.
    pub fn qemu_args(&self, media: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec!["-name".into(), self.signature.clone()];

        if let Some(machine) = &self.machine {
            args.extend(["-machine".into(), machine.clone()]);
        }
        args.extend(["-m".into(), self.memory.clone()]);

        args.extend([
            "-drive".into(),
            format!(
                "if=pflash,format=raw,readonly=on,file={}",
                opt_path(&self.firmware)
            ),
            "-drive".into(),
            format!("format=raw,file=fat:rw:{}", opt_path(media)),
        ]);

        if let Some(dev) = self.exit_device {
            args.extend([
                "-device".into(),
                format!("isa-debug-exit,iobase={:#x},iosize={:#x}", dev.iobase, dev.iosize),
            ]);
        }

        // Serial port and monitor share one mux chardev; its logfile holds
        // the whole session transcript.
        args.extend([
            "-chardev".into(),
            format!(
                "stdio,id=char0,mux=on,logfile={},signal=off",
                opt_path(&self.serial_log)
            ),
            "-serial".into(),
            "chardev:char0".into(),
            "-mon".into(),
            "chardev=char0".into(),
        ]);

        if !self.display {
            args.extend(["-display".into(), "none".into()]);
        }

        if self.gdb_stub {
            args.extend(["-gdb".into(), format!("tcp::{}", self.gdb_port)]);
            if self.wait_for_attach {
                args.push("-S".into());
            }
        }

        if self.trace {
            args.extend([
                "-d".into(),
                self.trace_events.clone(),
                "-D".into(),
                self.trace_log.display().to_string(),
            ]);
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// What happens to the emulator when its handle is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPolicy {
    /// Leave it running for manual follow-up.
    Keep,
    /// Kill it when the harness exits.
    Terminate,
}

/// A running emulator started by [`launch`].
#[derive(Debug)]
pub struct EmulatorProcess {
    child: Child,
    config: LaunchConfig,
    logs: LogFiles,
    policy: ExitPolicy,
    exited: Option<ExitStatus>,
}

impl EmulatorProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn logs(&self) -> &LogFiles {
        &self.logs
    }

    pub fn set_exit_policy(&mut self, policy: ExitPolicy) {
        self.policy = policy;
    }

    /// The exit status, if the process has ended.
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.exited.is_none() {
            self.exited = self.child.try_wait().ok().flatten();
        }
        self.exited
    }

    pub fn is_running(&mut self) -> bool {
        self.poll_exit().is_none()
    }

    /// Kill the emulator and remove its pid marker.
    pub fn terminate(&mut self) -> Result<(), LaunchError> {
        if self.is_running() {
            dprintln!("Terminating emulator (pid {})", self.pid());
            self.child
                .kill()
                .map_err(LaunchError::io("killing emulator"))?;
            self.exited = Some(self.child.wait().map_err(LaunchError::io("reaping emulator"))?);
        }
        remove_marker(&self.config.pid_marker);
        Ok(())
    }
}

impl Drop for EmulatorProcess {
    fn drop(&mut self) {
        if self.policy == ExitPolicy::Terminate {
            if let Err(e) = self.terminate() {
                wprintln!("{e}");
            }
        }
    }
}

/// Start the emulator on `media`, replacing any stale instance.
///
/// Returns as soon as the process has survived the startup grace period; it
/// does not wait for the guest.
pub fn launch(config: &LaunchConfig, media: &BootMedia) -> Result<EmulatorProcess, HarnessError> {
    let killed = terminate_stale(config)?;
    if !killed.is_empty() {
        dprintln!("Terminated stale emulator instance(s): {killed:?}");
    }

    let logs = LogFiles::for_launch(config);
    logs.prepare().map_err(LaunchError::io("preparing log files"))?;
    let stderr = logs
        .open_stderr()
        .map_err(LaunchError::io("opening emulator stderr log"))?;

    let args = config.qemu_args(media.root());
    dprintln!("Launching {}", config.emulator);
    vprintln!("  {} {}", config.emulator, args.join(" "));

    let child = Command::new(&config.emulator)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(stderr)
        .process_group(0)
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LaunchError::BinaryMissing {
                binary: config.emulator.clone(),
            },
            _ => LaunchError::Io {
                what: format!("spawning {}", config.emulator),
                source: e,
            },
        })?;

    // Killed on any early return below; kept once it is up.
    let mut process = EmulatorProcess {
        child,
        config: config.clone(),
        logs,
        policy: ExitPolicy::Terminate,
        exited: None,
    };

    if let Some(dir) = config.pid_marker.parent() {
        fs::create_dir_all(dir).map_err(LaunchError::io("creating log directory"))?;
    }
    fs::write(&config.pid_marker, format!("{}\n", process.pid()))
        .map_err(LaunchError::io("writing pid marker"))?;

    let deadline = Instant::now() + config.startup_grace;
    while Instant::now() < deadline {
        if let Some(status) = process.poll_exit() {
            remove_marker(&config.pid_marker);
            return Err(LaunchError::ExitedImmediately {
                status,
                stderr: logs::tail(&process.logs.stderr, 20),
            }
            .into());
        }
        thread::sleep(POLL_INTERVAL);
    }

    process.policy = ExitPolicy::Keep;
    dprintln!("Emulator running (pid {})", process.pid());
    Ok(process)
}

/// Kill every live process that carries this configuration's signature,
/// starting with the one recorded in the pid marker. Returns their pids.
pub fn terminate_stale(config: &LaunchConfig) -> Result<Vec<i32>, LaunchError> {
    let mut killed = Vec::new();

    if let Some(pid) = read_marker(&config.pid_marker) {
        if is_alive(pid) && has_signature(pid, &config.signature) {
            kill_and_wait(pid)?;
            killed.push(pid);
        } else {
            vprintln!("  pid marker {pid} is not a live instance; ignoring");
        }
    }

    for pid in signed_processes(&config.signature) {
        if !killed.contains(&pid) {
            kill_and_wait(pid)?;
            killed.push(pid);
        }
    }

    remove_marker(&config.pid_marker);
    Ok(killed)
}

/// Kill the instance recorded in the pid marker, if it is still ours.
pub fn stop_recorded(config: &LaunchConfig) -> Result<Option<i32>, LaunchError> {
    let Some(pid) = read_marker(&config.pid_marker) else {
        return Ok(None);
    };
    let live = is_alive(pid) && has_signature(pid, &config.signature);
    if live {
        kill_and_wait(pid)?;
    }
    remove_marker(&config.pid_marker);
    Ok(live.then_some(pid))
}

fn read_marker(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn remove_marker(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Alive and not a zombie.
fn is_alive(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        // The state letter follows the parenthesized command name.
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| state != 'Z' && state != 'X'),
        Err(_) => kill(Pid::from_raw(pid), None).is_ok(),
    }
}

fn cmdline(pid: i32) -> Option<Vec<String>> {
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    Some(
        raw.split(|&b| b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect(),
    )
}

fn matches_signature(args: &[String], signature: &str) -> bool {
    args.windows(2).any(|w| w[0] == "-name" && w[1] == signature)
}

fn has_signature(pid: i32, signature: &str) -> bool {
    cmdline(pid).is_some_and(|args| matches_signature(&args, signature))
}

/// Live processes other than this one whose command line carries `signature`.
fn signed_processes(signature: &str) -> Vec<i32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    let me = i32::try_from(std::process::id()).unwrap_or(-1);
    let mut pids: Vec<i32> = entries
        .filter_map(|e| e.ok()?.file_name().to_str()?.parse().ok())
        .filter(|&pid| pid != me && is_alive(pid) && has_signature(pid, signature))
        .collect();
    pids.sort_unstable();
    pids
}

fn kill_and_wait(pid: i32) -> Result<(), LaunchError> {
    vprintln!("  killing stale emulator pid {pid}");
    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => {
            return Err(LaunchError::Io {
                what: format!("killing stale emulator {pid}"),
                source: e.into(),
            });
        }
    }

    let deadline = Instant::now() + STALE_EXIT_WAIT;
    while is_alive(pid) {
        if Instant::now() >= deadline {
            return Err(LaunchError::Io {
                what: format!("stale emulator {pid} did not exit"),
                source: io::ErrorKind::TimedOut.into(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::process::ExitStatusExt;

    fn config(dir: &Path, emulator: &str, signature: &str) -> LaunchConfig {
        LaunchConfig {
            emulator: emulator.into(),
            signature: signature.into(),
            machine: Some("q35".into()),
            memory: "4G".into(),
            firmware: dir.join("OVMF_CODE.fd"),
            exit_device: Some(ExitDevice::default()),
            display: false,
            gdb_stub: false,
            wait_for_attach: false,
            gdb_port: 1234,
            trace: false,
            trace_events: "int,cpu_reset".into(),
            serial_log: dir.join("logs/serial.log"),
            trace_log: dir.join("logs/qemu.log"),
            stderr_log: dir.join("logs/qemu.stderr.log"),
            pid_marker: dir.join("logs/qemu.pid"),
            extra_args: Vec::new(),
            startup_grace: Duration::from_millis(300),
        }
    }

    fn fake_emulator(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-qemu");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn media(dir: &Path) -> BootMedia {
        fs::create_dir_all(dir.join("esp")).unwrap();
        BootMedia::existing(&dir.join("esp"))
    }

    fn unique_signature(tag: &str) -> String {
        format!("bootprobe-test-{tag}-{}", std::process::id())
    }

    fn pair(args: &[String], flag: &str) -> Option<String> {
        let pos = args.iter().position(|a| a == flag)?;
        args.get(pos + 1).cloned()
    }

    #[test]
    fn base_arguments() {
        let cfg = config(Path::new("/p"), "qemu-system-x86_64", "bootprobe-je4os");
        let args = cfg.qemu_args(Path::new("/p/esp"));
        assert_eq!(&args[..2], ["-name", "bootprobe-je4os"]);
        assert_eq!(pair(&args, "-machine").as_deref(), Some("q35"));
        assert_eq!(pair(&args, "-m").as_deref(), Some("4G"));
        assert!(args.contains(&"format=raw,file=fat:rw:/p/esp".to_string()));
        assert!(args.contains(&"if=pflash,format=raw,readonly=on,file=/p/OVMF_CODE.fd".to_string()));
        assert_eq!(
            pair(&args, "-device").as_deref(),
            Some("isa-debug-exit,iobase=0xf4,iosize=0x4")
        );
        assert_eq!(
            pair(&args, "-chardev").as_deref(),
            Some("stdio,id=char0,mux=on,logfile=/p/logs/serial.log,signal=off")
        );
        assert_eq!(pair(&args, "-serial").as_deref(), Some("chardev:char0"));
        assert_eq!(pair(&args, "-mon").as_deref(), Some("chardev=char0"));
        assert_eq!(pair(&args, "-display").as_deref(), Some("none"));
        assert!(!args.iter().any(|a| a == "-gdb" || a == "-S" || a == "-d"));
    }

    #[test]
    fn debug_toggles_are_independent() {
        let mut cfg = config(Path::new("/p"), "qemu", "sig");
        cfg.gdb_stub = true;
        let args = cfg.qemu_args(Path::new("/p/esp"));
        assert_eq!(pair(&args, "-gdb").as_deref(), Some("tcp::1234"));
        assert!(!args.contains(&"-S".to_string()));
        assert!(!args.contains(&"-d".to_string()));

        cfg.wait_for_attach = true;
        assert!(cfg.qemu_args(Path::new("/p/esp")).contains(&"-S".to_string()));

        cfg.gdb_stub = false;
        cfg.trace = true;
        let args = cfg.qemu_args(Path::new("/p/esp"));
        assert!(!args.contains(&"-gdb".to_string()));
        assert!(!args.contains(&"-S".to_string()));
        assert_eq!(pair(&args, "-d").as_deref(), Some("int,cpu_reset"));
        assert_eq!(pair(&args, "-D").as_deref(), Some("/p/logs/qemu.log"));
    }

    #[test]
    fn machine_and_exit_device_are_optional() {
        let mut cfg = config(Path::new("/p"), "qemu", "sig");
        cfg.machine = None;
        cfg.exit_device = None;
        cfg.extra_args = vec!["-smp".into(), "2".into()];
        let args = cfg.qemu_args(Path::new("/p/esp"));
        assert!(!args.contains(&"-machine".to_string()));
        assert!(!args.contains(&"-device".to_string()));
        assert_eq!(&args[args.len() - 2..], ["-smp", "2"]);
    }

    #[test]
    fn commas_in_paths_are_escaped() {
        let cfg = config(Path::new("/p"), "qemu", "sig");
        let args = cfg.qemu_args(Path::new("/tmp/a,b"));
        assert!(args.contains(&"format=raw,file=fat:rw:/tmp/a,,b".to_string()));
    }

    #[test]
    fn guest_exit_code_decoding() {
        // Guest wrote 0x10 → QEMU exit code 0x21.
        assert_eq!(ExitDevice::guest_code(ExitStatus::from_raw(0x21 << 8)), Some(0x10));
        assert_eq!(ExitDevice::guest_code(ExitStatus::from_raw(0)), None);
    }

    #[test]
    fn signature_matching() {
        let args: Vec<String> = ["qemu", "-name", "bootprobe-je4os", "-m", "4G"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert!(matches_signature(&args, "bootprobe-je4os"));
        assert!(!matches_signature(&args, "bootprobe-other"));
        assert!(!matches_signature(&args[2..], "bootprobe-je4os"));
    }

    #[test]
    fn missing_binary_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "/nonexistent/qemu-system-x86_64", &unique_signature("missing"));
        let err = launch(&cfg, &media(dir.path())).unwrap_err();
        assert!(matches!(err, HarnessError::Launch(LaunchError::BinaryMissing { .. })));
    }

    #[test]
    fn immediate_exit_is_launch_error_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let emu = fake_emulator(dir.path(), "echo 'could not load PC BIOS' >&2\nexit 1");
        let cfg = config(dir.path(), &emu, &unique_signature("exit"));
        match launch(&cfg, &media(dir.path())).unwrap_err() {
            HarnessError::Launch(LaunchError::ExitedImmediately { stderr, .. }) => {
                assert!(stderr.contains("could not load PC BIOS"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!cfg.pid_marker.exists());
    }

    #[test]
    fn relaunch_replaces_stale_instance() {
        let dir = tempfile::tempdir().unwrap();
        let emu = fake_emulator(dir.path(), "sleep 30 &\nwait");
        let cfg = config(dir.path(), &emu, &unique_signature("stale"));

        let mut first = launch(&cfg, &media(dir.path())).unwrap();
        let first_pid = i32::try_from(first.pid()).unwrap();
        fs::write(&cfg.serial_log, "previous boot\n").unwrap();

        let mut second = launch(&cfg, &media(dir.path())).unwrap();
        second.set_exit_policy(ExitPolicy::Terminate);

        assert!(!first.is_running());
        assert!(second.is_running());
        assert_eq!(fs::read_to_string(&cfg.serial_log).unwrap(), "");
        assert_eq!(read_marker(&cfg.pid_marker), i32::try_from(second.pid()).ok());
        assert_eq!(signed_processes(&cfg.signature), vec![i32::try_from(second.pid()).unwrap()]);
        assert_ne!(first_pid, i32::try_from(second.pid()).unwrap());

        drop(second);
        assert!(signed_processes(&cfg.signature).is_empty());
        assert!(!cfg.pid_marker.exists());
    }

    #[test]
    fn stop_recorded_kills_marked_instance() {
        let dir = tempfile::tempdir().unwrap();
        let emu = fake_emulator(dir.path(), "sleep 30 &\nwait");
        let cfg = config(dir.path(), &emu, &unique_signature("stop"));

        let mut process = launch(&cfg, &media(dir.path())).unwrap();
        let pid = i32::try_from(process.pid()).unwrap();
        assert_eq!(stop_recorded(&cfg).unwrap(), Some(pid));
        assert!(!process.is_running());
        assert_eq!(stop_recorded(&cfg).unwrap(), None);
    }
}
