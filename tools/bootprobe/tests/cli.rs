//! Integration tests for the bootprobe binary.
//!
//! Each test builds a throwaway project directory with a `bootprobe.toml`, a
//! shell script standing in for QEMU and, where a debug session is needed, a
//! small in-process GDB stub listening on an ephemeral port.

use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread::{self, JoinHandle};

use bootprobe_elf::synth::SymtabImage;

const BOOT_COMPLETE: u64 = 0xffff_ffff_8000_1000;
const SENTINEL: &str = "@@BOOTPROBE:BOOT_COMPLETE@@";

struct Project {
    dir: tempfile::TempDir,
    name: String,
}

impl Project {
    fn new(tag: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("BOOTX64.EFI"), b"MZ fake loader").unwrap();
        fs::write(dir.path().join("OVMF_CODE.fd"), b"firmware").unwrap();
        Self {
            dir,
            name: format!("it-{tag}-{}", std::process::id()),
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn kernel(&self) -> PathBuf {
        let path = self.path("kernel.elf");
        let image = SymtabImage::new()
            .function("kmain", 0xffff_ffff_8000_0000, 0x100)
            .function("boot_complete", BOOT_COMPLETE, 0x20)
            .build();
        fs::write(&path, image).unwrap();
        path
    }

    /// Write `bootprobe.toml`; `extra` is appended after the `[qemu]` table.
    fn configure(&self, qemu: &Path, extra: &str) {
        let config = format!(
            r#"
[project]
name = "{name}"

[bootloader]
prebuilt = "BOOTX64.EFI"

[qemu]
binary = "{qemu}"
firmware = "OVMF_CODE.fd"
startup-grace-ms = 300

{extra}
"#,
            name = self.name,
            qemu = qemu.display(),
        );
        fs::write(self.path("bootprobe.toml"), config).unwrap();
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_bootprobe"))
            .args(args)
            .current_dir(self.dir.path())
            .env_remove("BOOTPROBE_GDB")
            .env_remove("BOOTPROBE_WAIT_GDB")
            .env_remove("BOOTPROBE_TRACE")
            .env_remove("BOOTPROBE_FEATURES")
            .output()
            .expect("failed to execute bootprobe")
    }
}

fn describe(output: &Output) -> String {
    format!(
        "exit={:?}\nstdout:\n{}\nstderr:\n{}",
        output.status.code(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    )
}

// ---------------------------------------------------------------------------
// Minimal GDB stub
// ---------------------------------------------------------------------------

/// Next packet payload, or `"\x03"` for a break byte. `None` on EOF.
fn read_packet(stream: &mut TcpStream) -> Option<String> {
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).ok()?;
        match byte[0] {
            0x03 => return Some("\x03".into()),
            b'$' => break,
            _ => {}
        }
    }
    let mut payload = Vec::new();
    loop {
        stream.read_exact(&mut byte).ok()?;
        if byte[0] == b'#' {
            break;
        }
        payload.push(byte[0]);
    }
    let mut checksum = [0u8; 2];
    stream.read_exact(&mut checksum).ok()?;
    stream.write_all(b"+").ok()?;
    String::from_utf8(payload).ok()
}

fn send_packet(stream: &mut TcpStream, payload: &str) {
    let sum = payload.bytes().fold(0u8, |a, b| a.wrapping_add(b));
    let _ = write!(stream, "${payload}#{sum:02x}");
}

fn stop_at(addr: u64) -> String {
    let le: String = addr.to_le_bytes().iter().map(|b| format!("{b:02x}")).collect();
    format!("T05hwbreak:;10:{le};")
}

/// Serve one session. `run_to` is where a `c` stops; `None` runs until the
/// break byte arrives. Returns every packet received.
fn spawn_stub(run_to: Option<u64>) -> (u16, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut seen = Vec::new();
        while let Some(packet) = read_packet(&mut stream) {
            seen.push(packet.clone());
            match packet.as_str() {
                p if p.starts_with("qSupported") => send_packet(&mut stream, "hwbreak+"),
                "?" => send_packet(&mut stream, "S05"),
                "c" => {
                    if let Some(addr) = run_to {
                        send_packet(&mut stream, &stop_at(addr));
                    }
                }
                "\x03" => send_packet(&mut stream, &stop_at(0xffff_ffff_8000_0040)),
                "D" => {
                    send_packet(&mut stream, "OK");
                    break;
                }
                _ => send_packet(&mut stream, "OK"),
            }
        }
        seen
    });
    (port, handle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn missing_kernel_fails_before_launch() {
    let project = Project::new("nokernel");
    let marker = project.path("qemu-was-started");
    let qemu = project.script("qemu", &format!("touch {}\nsleep 30", marker.display()));
    project.configure(&qemu, "");

    let output = project.run(&["verify", "--no-build", "--kernel", "does-not-exist.elf"]);
    assert_eq!(output.status.code(), Some(3), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("kernel binary not found"));
    assert!(!marker.exists(), "emulator was launched");
}

#[test]
fn breakpoint_reached_prints_one_sentinel() {
    let project = Project::new("reach");
    let qemu = project.script("qemu", "sleep 30 &\nwait");
    let (port, stub) = spawn_stub(Some(BOOT_COMPLETE));
    project.configure(&qemu, &format!("[debug]\nport = {port}\n"));
    let kernel = project.kernel();

    let output = project.run(&[
        "verify",
        "--no-build",
        "--kernel",
        kernel.to_str().unwrap(),
        "--check",
        "boot_complete=BOOT_COMPLETE",
        "--timeout",
        "10",
        "--terminate",
    ]);
    assert!(output.status.success(), "{}", describe(&output));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().filter(|l| *l == SENTINEL).count(), 1, "{stdout}");

    let seen = stub.join().unwrap();
    assert!(seen.contains(&format!("Z1,{BOOT_COMPLETE:x},1")), "{seen:?}");
    assert_eq!(seen.iter().filter(|p| *p == "c").count(), 1);
    assert_eq!(seen.last().map(String::as_str), Some("D"));

    // Media was assembled in the canonical layout.
    assert!(project.path("esp/EFI/BOOT/BOOTX64.EFI").is_file());
    assert!(project.path("esp/kernel.elf").is_file());
    assert!(project.path("logs/serial.log").is_file());
}

#[test]
fn unreached_symbol_times_out_with_exit_5() {
    let project = Project::new("timeout");
    let qemu = project.script("qemu", "sleep 30 &\nwait");
    let (port, stub) = spawn_stub(None);
    project.configure(
        &qemu,
        &format!("[debug]\nport = {port}\n\n[verify]\ninterrupt-grace-ms = 2000\n"),
    );
    let kernel = project.kernel();

    let output = project.run(&[
        "verify",
        "--no-build",
        "--kernel",
        kernel.to_str().unwrap(),
        "--timeout",
        "1",
        "--terminate",
    ]);
    assert_eq!(output.status.code(), Some(5), "{}", describe(&output));
    assert!(!String::from_utf8_lossy(&output.stdout).contains("@@BOOTPROBE:"));

    let seen = stub.join().unwrap();
    assert!(seen.contains(&"\x03".to_string()), "{seen:?}");
    assert!(seen.contains(&format!("z1,{BOOT_COMPLETE:x},1")), "{seen:?}");
    assert_eq!(seen.last().map(String::as_str), Some("D"));
}

/// Running and not a zombie.
fn process_alive(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .is_some_and(|state| state != 'Z' && state != 'X')
}

#[test]
fn timeout_leaves_emulator_running() {
    let project = Project::new("keep");
    let qemu = project.script("qemu", "sleep 30 &\nwait");
    let (port, stub) = spawn_stub(None);
    project.configure(
        &qemu,
        &format!("[debug]\nport = {port}\n\n[verify]\ninterrupt-grace-ms = 2000\n"),
    );
    let kernel = project.kernel();

    let output = project.run(&[
        "verify",
        "--no-build",
        "--kernel",
        kernel.to_str().unwrap(),
        "--timeout",
        "1",
    ]);
    assert_eq!(output.status.code(), Some(5), "{}", describe(&output));
    stub.join().unwrap();

    let pid: u32 = fs::read_to_string(project.path("logs/qemu.pid"))
        .expect("pid marker kept after timeout")
        .trim()
        .parse()
        .unwrap();
    assert!(process_alive(pid), "emulator {pid} was killed on timeout");

    let stop = project.run(&["stop"]);
    assert!(stop.status.success(), "{}", describe(&stop));
    assert!(
        String::from_utf8_lossy(&stop.stdout).contains(&format!("pid {pid}")),
        "{}",
        describe(&stop)
    );
    assert!(!process_alive(pid));
    assert!(!project.path("logs/qemu.pid").exists());
}

#[test]
fn missing_emulator_is_launch_failure() {
    let project = Project::new("noqemu");
    project.configure(Path::new("/nonexistent/qemu-system-x86_64"), "");
    let kernel = project.kernel();

    let output = project.run(&["verify", "--no-build", "--kernel", kernel.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(4), "{}", describe(&output));
}

#[test]
fn emulator_exiting_at_startup_is_launch_failure() {
    let project = Project::new("qemuexit");
    let qemu = project.script("qemu", "echo 'qemu: could not open firmware' >&2\nexit 1");
    project.configure(&qemu, "");
    let kernel = project.kernel();

    let output = project.run(&["verify", "--no-build", "--kernel", kernel.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(4), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("could not open firmware"));
}

#[test]
fn toolchain_failure_is_build_failure() {
    let project = Project::new("build");
    let cargo = project.script("cargo", "echo 'error: could not compile `kernel`' >&2\nexit 101");
    let qemu = project.script("qemu", "sleep 30");
    project.configure(
        &qemu,
        &format!("[build]\ntoolchain = \"{}\"\ndir = \".\"\n", cargo.display()),
    );

    let output = project.run(&["build"]);
    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("could not compile"));
}

#[test]
fn assemble_is_repeatable() {
    let project = Project::new("assemble");
    let qemu = project.script("qemu", "sleep 30");
    project.configure(&qemu, "");
    let kernel = project.kernel();

    for _ in 0..2 {
        let output = project.run(&["assemble", "--kernel", kernel.to_str().unwrap()]);
        assert!(output.status.success(), "{}", describe(&output));
    }
    assert_eq!(
        fs::read(project.path("esp/kernel.elf")).unwrap(),
        fs::read(&kernel).unwrap()
    );
    assert_eq!(
        fs::read(project.path("esp/EFI/BOOT/BOOTX64.EFI")).unwrap(),
        b"MZ fake loader"
    );
}

#[test]
fn config_applies_target_profile() {
    let project = Project::new("profile");
    let qemu = project.script("qemu", "sleep 30");
    project.configure(
        &qemu,
        "[targets.legacy]\nbinary = \"kernel-legacy\"\nmachine = \"pc\"\nexit-device = { enabled = false }\n",
    );

    let output = project.run(&["config", "--profile", "legacy", "--trace"]);
    assert!(output.status.success(), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("machine:  pc"), "{stdout}");
    assert!(stdout.contains("exit dev: none"), "{stdout}");
    assert!(stdout.contains("kernel-legacy"), "{stdout}");
    assert!(stdout.contains("trace:    true"), "{stdout}");
}

#[test]
fn unknown_profile_is_configuration_error() {
    let project = Project::new("badprofile");
    let qemu = project.script("qemu", "sleep 30");
    project.configure(&qemu, "");

    let output = project.run(&["config", "--profile", "riscv"]);
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
}

#[test]
fn missing_config_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_bootprobe"))
        .arg("config")
        .current_dir(dir.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("bootprobe.toml"));
}

#[test]
fn stop_without_instance_succeeds() {
    let project = Project::new("stop");
    let qemu = project.script("qemu", "sleep 30");
    project.configure(&qemu, "");

    let output = project.run(&["stop"]);
    assert!(output.status.success(), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("No running instance"));
}
