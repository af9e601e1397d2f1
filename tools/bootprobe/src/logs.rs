//! Emulator log files.
//!
//! QEMU writes every file itself (serial transcript via the chardev
//! `logfile=`, interrupt trace via `-D`, diagnostics via its stderr); the
//! harness only resets them before a run and reads the stderr tail when a
//! launch fails. Nothing here parses log contents.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::launch::LaunchConfig;
use crate::verbose::vprintln;

/// The set of files one emulator run writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFiles {
    pub serial: PathBuf,
    /// Present only when the interrupt/reset trace is enabled.
    pub trace: Option<PathBuf>,
    pub stderr: PathBuf,
    /// Trace path of the configuration, removed even when tracing is off.
    stale_trace: PathBuf,
}

impl LogFiles {
    pub fn for_launch(config: &LaunchConfig) -> Self {
        Self {
            serial: config.serial_log.clone(),
            trace: config.trace.then(|| config.trace_log.clone()),
            stderr: config.stderr_log.clone(),
            stale_trace: config.trace_log.clone(),
        }
    }

    /// Delete output of any previous run and create empty files for this one.
    pub fn prepare(&self) -> io::Result<()> {
        for path in [&self.serial, &self.stale_trace, &self.stderr] {
            remove_if_exists(path)?;
        }
        for path in self.active() {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            File::create(path)?;
            vprintln!("  log: {}", path.display());
        }
        Ok(())
    }

    /// Open the stderr log for the emulator process to inherit.
    pub fn open_stderr(&self) -> io::Result<File> {
        File::options().append(true).create(true).open(&self.stderr)
    }

    fn active(&self) -> impl Iterator<Item = &PathBuf> {
        [Some(&self.serial), self.trace.as_ref(), Some(&self.stderr)]
            .into_iter()
            .flatten()
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// The last `lines` lines of a text file; empty if it cannot be read.
pub fn tail(path: &Path, lines: usize) -> String {
    let Ok(text) = fs::read_to_string(path) else {
        return String::new();
    };
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
