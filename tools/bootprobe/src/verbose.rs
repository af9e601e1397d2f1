//! Console output levels for harness diagnostics.
//!
//! - **Quiet** (`-q`): errors, sentinels and the final verdict only
//! - **Default**: one line per pipeline stage
//! - **Verbose** (`-v`): composed command lines, protocol traffic, stage timings
//!
//! Sentinel markers are written through the controller's sink and are never
//! filtered by the level set here.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

/// Output level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Quiet = 0,
    Default = 1,
    Verbose = 2,
}

static LEVEL: AtomicU8 = AtomicU8::new(Level::Default as u8);

/// Set the output level once at startup.
pub fn init(quiet: bool, verbose: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Level::Quiet,
        (false, true) => Level::Verbose,
        (false, false) => Level::Default,
    };
    LEVEL.store(level as u8, Ordering::Relaxed);
}

/// The current output level.
pub fn level() -> Level {
    match LEVEL.load(Ordering::Relaxed) {
        0 => Level::Quiet,
        2 => Level::Verbose,
        _ => Level::Default,
    }
}

pub fn is_verbose() -> bool {
    level() == Level::Verbose
}

pub fn is_quiet() -> bool {
    level() == Level::Quiet
}

/// `println!` that only prints in verbose mode.
macro_rules! vprintln {
    ($($arg:tt)*) => {
        if $crate::verbose::is_verbose() {
            println!($($arg)*);
        }
    };
}

pub(crate) use vprintln;

/// `println!` that is suppressed in quiet mode.
macro_rules! dprintln {
    ($($arg:tt)*) => {
        if !$crate::verbose::is_quiet() {
            println!($($arg)*);
        }
    };
}

pub(crate) use dprintln;

/// Warning on stderr, printed at every level.
macro_rules! wprintln {
    ($($arg:tt)*) => {
        eprintln!("warning: {}", format_args!($($arg)*));
    };
}

pub(crate) use wprintln;

/// Prints how long a pipeline stage took when dropped (verbose mode only).
pub struct StageTimer {
    stage: &'static str,
    start: Instant,
}

impl StageTimer {
    pub fn start(stage: &'static str) -> Self {
        Self {
            stage,
            start: Instant::now(),
        }
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        if is_verbose() {
            println!("  {} took {:.1?}", self.stage, self.start.elapsed());
        }
    }
}
