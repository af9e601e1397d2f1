//! Verification sessions.
//!
//! Each check is one attach cycle: connect, break on the symbol, resume, and
//! wait for the trap under a watchdog timeout. The wait itself blocks with no
//! timeout, so it runs on a scoped thread while this thread waits on a
//! channel; when the deadline passes the target is interrupted (or, if the
//! stub stays silent, the socket is severed) to unblock it.

use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::config::VerifyConfig;
use crate::controller::{BreakpointEvent, Halt, RemoteDebugController};
use crate::error::HarnessError;
use crate::symbols::SymbolTable;
use crate::verbose::{dprintln, vprintln, wprintln};

/// Upper bound on the delay between connection attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// A symbol that must be reached, and the sentinel announcing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub symbol: String,
    pub sentinel: String,
}

impl Check {
    pub fn new(symbol: impl Into<String>, sentinel: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            sentinel: sentinel.into(),
        }
    }
}

/// `symbol=LABEL`, or a bare `symbol` whose label is its upper-case name.
impl FromStr for Check {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (symbol, sentinel) = match s.split_once('=') {
            Some((symbol, label)) => (symbol.trim(), label.trim().to_owned()),
            None => (s.trim(), s.trim().to_uppercase()),
        };
        if symbol.is_empty() || sentinel.is_empty() {
            return Err(format!("invalid check `{s}`, expected SYMBOL=LABEL"));
        }
        if sentinel.contains(char::is_whitespace) || sentinel.contains('@') {
            return Err(format!("invalid sentinel label `{sentinel}`"));
        }
        Ok(Self::new(symbol, sentinel))
    }
}

/// Connect, retrying only while the stub is not yet listening.
///
/// The delay doubles after each failed attempt, up to [`MAX_BACKOFF`].
pub fn connect_with_retry<'a>(
    endpoint: &str,
    symbols: &'a SymbolTable,
    attempts: u32,
    backoff: Duration,
) -> Result<RemoteDebugController<'a>, HarnessError> {
    let attempts = attempts.max(1);
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match RemoteDebugController::connect(endpoint, symbols) {
            Err(HarnessError::Connection { source, .. }) if attempt < attempts => {
                vprintln!("  connect attempt {attempt}/{attempts} failed: {source}; retrying in {delay:?}");
                thread::sleep(delay);
                delay = (delay * 2).min(MAX_BACKOFF);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Wait until a breakpoint is hit, resuming past any other stop. Returns the
/// first halt seen after `interrupted` is set, wherever it is.
fn wait_for_breakpoint(
    ctl: &mut RemoteDebugController<'_>,
    interrupted: &AtomicBool,
) -> Result<Halt, HarnessError> {
    loop {
        let halt = ctl.await_halt()?;
        if halt.at_breakpoint || interrupted.load(Ordering::SeqCst) {
            return Ok(halt);
        }
        vprintln!(
            "  stopped in {} without a breakpoint (signal {}); resuming",
            halt.symbol.as_deref().unwrap_or("unknown code"),
            halt.signal
        );
        ctl.resume()?;
    }
}

/// Run one check against the stub in `config`.
///
/// On timeout the target is stopped, the session detaches cleanly, and the
/// emulator is left running.
pub fn verify_check(
    check: &Check,
    symbols: &SymbolTable,
    config: &VerifyConfig,
    sink: Box<dyn Write + Send>,
) -> Result<BreakpointEvent, HarnessError> {
    dprintln!("Verifying {} (timeout {:?})", check.symbol, config.timeout);

    let mut ctl = connect_with_retry(
        &config.endpoint,
        symbols,
        config.connect_attempts,
        config.connect_backoff,
    )?
    .with_sink(sink);
    let address = ctl.set_breakpoint(&check.symbol)?;
    let interrupter = ctl.interrupter()?;
    ctl.resume()?;

    let interrupted = AtomicBool::new(false);
    let outcome = thread::scope(|s| {
        let (tx, rx) = mpsc::channel();
        let worker_ctl = &mut ctl;
        let flag = &interrupted;
        s.spawn(move || {
            let _ = tx.send(wait_for_breakpoint(worker_ctl, flag));
        });

        match rx.recv_timeout(config.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                interrupted.store(true, Ordering::SeqCst);
                vprintln!("  timed out; interrupting target");
                if let Err(e) = interrupter.interrupt() {
                    vprintln!("  interrupt failed: {e}");
                }
                rx.recv_timeout(config.interrupt_grace).unwrap_or_else(|_| {
                    wprintln!("stub did not answer the interrupt; closing the connection");
                    interrupter.sever();
                    rx.recv().unwrap_or_else(|_| {
                        Err(HarnessError::ConnectionLost("wait was abandoned".into()))
                    })
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(HarnessError::ConnectionLost(
                "wait ended without a result".into(),
            )),
        }
    });

    match outcome {
        Ok(halt) if halt.at_breakpoint => {
            let hits = ctl
                .session()
                .breakpoints
                .iter()
                .find(|bp| bp.address == address)
                .map_or(1, |bp| bp.hits);
            ctl.emit_sentinel(&check.sentinel);
            let event = BreakpointEvent {
                symbol: check.symbol.clone(),
                address: halt.address,
                sentinel: check.sentinel.clone(),
                hits,
            };
            ctl.disconnect()?;
            dprintln!("Reached {} at {}", check.symbol, symbols.describe(address));
            Ok(event)
        }
        _ if interrupted.load(Ordering::SeqCst) => {
            if let Some(halt) = &ctl.session().last_halt {
                dprintln!("Target was at {} when stopped", symbols.describe(halt.address));
            }
            if let Err(e) = ctl.disconnect() {
                wprintln!("detach after timeout failed: {e}");
            }
            Err(HarnessError::VerificationTimeout {
                symbol: check.symbol.clone(),
                timeout: config.timeout,
            })
        }
        Ok(halt) => Err(HarnessError::protocol(format!(
            "target stopped at {} outside any breakpoint",
            symbols.describe(halt.address)
        ))),
        Err(e) => Err(e),
    }
}

/// Run every check in order as separate attach cycles, stopping at the first
/// failure.
pub fn verify_all(
    symbols: &SymbolTable,
    config: &VerifyConfig,
    mut sink: impl FnMut() -> Box<dyn Write + Send>,
) -> Result<Vec<BreakpointEvent>, HarnessError> {
    config
        .checks
        .iter()
        .map(|check| verify_check(check, symbols, config, sink()))
        .collect()
}
