//! Remote debug controller.
//!
//! Drives the emulator's GDB stub through one attach cycle: connect, install
//! hardware breakpoints on kernel symbols, resume, wait for traps, and
//! detach. Each trap at a breakpoint is reported exactly once, and each
//! sentinel label is written at most once per attach.

use std::collections::HashSet;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::error::HarnessError;
use crate::rsp::packet::{self, parse_le_register};
use crate::rsp::{Connection, StopReply};
use crate::symbols::SymbolTable;
use crate::verbose::{dprintln, vprintln, wprintln};

/// Longest wait for the answer to an ordinary request.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte offset of `rip` in a `g` reply: 16 general registers of 8 bytes,
/// two hex digits each.
const G_PC_OFFSET: usize = 16 * 8 * 2;

/// The marker line written for a reached checkpoint.
pub fn sentinel_line(label: &str) -> String {
    format!("@@BOOTPROBE:{label}@@")
}

/// Connection state of one attach cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No socket open.
    Disconnected,
    /// Socket open, preamble not yet answered.
    Connected,
    /// Target executing after `c`.
    Running,
    /// Target stopped; breakpoints may be changed.
    Halted,
}

/// An installed hardware breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Symbol as given by the caller.
    pub symbol: String,
    /// Resolved address.
    pub address: u64,
    /// Traps at this address in the current attach.
    pub hits: u32,
}

/// Where and why the target stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Halt {
    /// Program counter at the stop.
    pub address: u64,
    /// Function containing `address`, if any.
    pub symbol: Option<String>,
    /// Signal number from the stop reply.
    pub signal: u8,
    /// `address` is one of the installed breakpoints.
    pub at_breakpoint: bool,
}

/// A reached checkpoint, as reported to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointEvent {
    /// Symbol that was reached.
    pub symbol: String,
    /// Address the target halted at.
    pub address: u64,
    /// Label written as `@@BOOTPROBE:<label>@@`.
    pub sentinel: String,
    /// Hit count when the event was recorded.
    pub hits: u32,
}

/// State of the current attach cycle.
#[derive(Debug)]
pub struct DebugSession {
    /// Where the cycle is.
    pub state: SessionState,
    /// Breakpoints installed in this attach.
    pub breakpoints: Vec<Breakpoint>,
    /// Most recent stop, kept for timeout reports.
    pub last_halt: Option<Halt>,
}

impl DebugSession {
    fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            breakpoints: Vec::new(),
            last_halt: None,
        }
    }
}

/// Handle for stopping a blocked [`RemoteDebugController::await_halt`] from
/// another thread.
#[derive(Debug)]
pub struct Interrupter {
    stream: TcpStream,
}

impl Interrupter {
    /// Ask the stub to stop the target; the blocked wait then sees a halt.
    pub fn interrupt(&self) -> io::Result<()> {
        (&self.stream).write_all(&[packet::INTERRUPT])
    }

    /// Close the socket; the blocked wait fails with `ConnectionLost`.
    pub fn sever(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// One attach cycle against a GDB stub.
pub struct RemoteDebugController<'a> {
    conn: Option<Connection>,
    endpoint: String,
    session: DebugSession,
    symbols: &'a SymbolTable,
    sink: Box<dyn Write + Send>,
    emitted: HashSet<String>,
}

impl<'a> RemoteDebugController<'a> {
    /// Attach to the stub at `endpoint` and query why the target is stopped.
    ///
    /// A stub that is not listening yields [`HarnessError::Connection`];
    /// retrying is up to the caller.
    pub fn connect(endpoint: &str, symbols: &'a SymbolTable) -> Result<Self, HarnessError> {
        let conn = Connection::connect(endpoint).map_err(|source| HarnessError::Connection {
            endpoint: endpoint.to_owned(),
            source,
        })?;
        let mut ctl = Self {
            conn: Some(conn),
            endpoint: endpoint.to_owned(),
            session: DebugSession::new(),
            symbols,
            sink: Box::new(io::stdout()),
            emitted: HashSet::new(),
        };
        ctl.session.state = SessionState::Connected;
        ctl.handshake()?;
        Ok(ctl)
    }

    /// Write sentinels to `sink` instead of stdout.
    #[must_use]
    pub fn with_sink(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.sink = sink;
        self
    }

    /// Current session state.
    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// Breakpoints and last halt of the current attach.
    pub fn session(&self) -> &DebugSession {
        &self.session
    }

    fn conn(&mut self) -> Result<&mut Connection, HarnessError> {
        self.conn
            .as_mut()
            .ok_or_else(|| HarnessError::ConnectionLost("not attached".into()))
    }

    /// Run `op` on the connection; a lost connection ends the session.
    fn with_conn<T>(
        &mut self,
        op: impl FnOnce(&mut Connection) -> Result<T, HarnessError>,
    ) -> Result<T, HarnessError> {
        let result = op(self.conn()?);
        if let Err(HarnessError::ConnectionLost(_)) = &result {
            if let Some(conn) = self.conn.take() {
                conn.shutdown();
            }
            self.session.state = SessionState::Disconnected;
        }
        result
    }

    fn handshake(&mut self) -> Result<(), HarnessError> {
        let reply = self.with_conn(|conn| {
            conn.set_reply_timeout(Some(REPLY_TIMEOUT))?;
            let features = conn.request("qSupported:hwbreak+;swbreak+")?;
            vprintln!("  stub features: {}", String::from_utf8_lossy(&features));
            conn.request("?")
        })?;

        match StopReply::parse(&reply).map_err(HarnessError::Protocol)? {
            StopReply::Signal { signal, .. } => {
                dprintln!("Attached to {} (target stopped, signal {signal})", self.endpoint);
                self.session.state = SessionState::Halted;
                Ok(())
            }
            StopReply::Exited { code } => Err(self.lost(format!("target already exited ({code})"))),
            StopReply::Terminated { signal } => {
                Err(self.lost(format!("target already terminated (signal {signal})")))
            }
        }
    }

    fn lost(&mut self, reason: String) -> HarnessError {
        if let Some(conn) = self.conn.take() {
            conn.shutdown();
        }
        self.session.state = SessionState::Disconnected;
        HarnessError::ConnectionLost(reason)
    }

    fn require(&self, state: SessionState, action: &str) -> Result<(), HarnessError> {
        if self.session.state == state {
            Ok(())
        } else {
            Err(HarnessError::protocol(format!(
                "cannot {action} while {:?}",
                self.session.state
            )))
        }
    }

    /// Resolve `symbol` and install a hardware breakpoint on it.
    pub fn set_breakpoint(&mut self, symbol: &str) -> Result<u64, HarnessError> {
        self.require(SessionState::Halted, "set a breakpoint")?;
        let address = self
            .symbols
            .resolve(symbol)
            .ok_or_else(|| HarnessError::protocol(format!("unknown symbol `{symbol}`")))?;
        if self.session.breakpoints.iter().any(|bp| bp.address == address) {
            return Ok(address);
        }

        let reply = self.with_conn(|conn| conn.request(&format!("Z1,{address:x},1")))?;
        if reply != b"OK" {
            return Err(HarnessError::protocol(format!(
                "stub refused breakpoint on `{symbol}` at {address:#x}: `{}`",
                String::from_utf8_lossy(&reply)
            )));
        }

        vprintln!("  breakpoint: {symbol} at {address:#x}");
        self.session.breakpoints.push(Breakpoint {
            symbol: symbol.to_owned(),
            address,
            hits: 0,
        });
        Ok(address)
    }

    /// Let the target run. Does not wait for it to stop.
    pub fn resume(&mut self) -> Result<(), HarnessError> {
        self.require(SessionState::Halted, "resume")?;
        self.with_conn(|conn| conn.send("c"))?;
        self.session.state = SessionState::Running;
        Ok(())
    }

    /// Block until the target stops.
    ///
    /// There is no timeout here; use an [`Interrupter`] to bound the wait.
    pub fn await_halt(&mut self) -> Result<Halt, HarnessError> {
        self.require(SessionState::Running, "wait for a halt")?;
        let reply = self.with_conn(|conn| {
            conn.set_reply_timeout(None)?;
            let reply = next_stop_reply(conn);
            conn.set_reply_timeout(Some(REPLY_TIMEOUT))?;
            reply
        })?;

        let (signal, pc, hw_break) = match StopReply::parse(&reply).map_err(HarnessError::Protocol)? {
            StopReply::Signal {
                signal,
                pc,
                hw_break,
            } => (signal, pc, hw_break),
            StopReply::Exited { code } => {
                return Err(self.lost(format!("target exited with status {code}")));
            }
            StopReply::Terminated { signal } => {
                return Err(self.lost(format!("target terminated by signal {signal}")));
            }
        };
        self.session.state = SessionState::Halted;

        let address = match pc {
            Some(pc) => pc,
            None => self.read_pc()?,
        };

        let breakpoint = self
            .session
            .breakpoints
            .iter_mut()
            .find(|bp| bp.address == address);
        let at_breakpoint = breakpoint.is_some();
        if let Some(bp) = breakpoint {
            bp.hits += 1;
        }

        let halt = Halt {
            address,
            symbol: self.symbols.name_at(address).map(String::from),
            signal,
            at_breakpoint,
        };
        vprintln!(
            "  halted at {} (signal {signal}{})",
            self.symbols.describe(address),
            if hw_break { ", hwbreak" } else { "" }
        );
        self.session.last_halt = Some(halt.clone());
        Ok(halt)
    }

    fn read_pc(&mut self) -> Result<u64, HarnessError> {
        let reply = self.with_conn(|conn| conn.request("p10"))?;
        if let Some(pc) = parse_le_register(&reply) {
            return Ok(pc);
        }

        // Some stubs only implement the full register dump.
        let regs = self.with_conn(|conn| conn.request("g"))?;
        regs.get(G_PC_OFFSET..G_PC_OFFSET + 16)
            .and_then(parse_le_register)
            .ok_or_else(|| {
                HarnessError::protocol(format!(
                    "cannot read program counter (`p10` answered `{}`)",
                    String::from_utf8_lossy(&reply)
                ))
            })
    }

    /// Write the sentinel line for `label`, unless this attach already did.
    ///
    /// Returns whether a line was written.
    pub fn emit_sentinel(&mut self, label: &str) -> bool {
        if !self.emitted.insert(label.to_owned()) {
            return false;
        }
        let written = writeln!(self.sink, "{}", sentinel_line(label)).and_then(|()| self.sink.flush());
        if let Err(e) = written {
            wprintln!("failed to write sentinel {label}: {e}");
        }
        true
    }

    /// A handle that can stop a blocked [`Self::await_halt`] from another thread.
    pub fn interrupter(&self) -> Result<Interrupter, HarnessError> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| HarnessError::ConnectionLost("not attached".into()))?;
        let stream = conn
            .try_clone_stream()
            .map_err(|e| HarnessError::ConnectionLost(e.to_string()))?;
        Ok(Interrupter { stream })
    }

    /// Detach, leaving the target running.
    ///
    /// A running target is stopped first so breakpoints can be removed. The
    /// socket is closed even if the stub misbehaves along the way.
    pub fn disconnect(&mut self) -> Result<(), HarnessError> {
        let Some(mut conn) = self.conn.take() else {
            self.session.state = SessionState::Disconnected;
            return Ok(());
        };
        let result = detach(&mut conn, &self.session);
        conn.shutdown();
        self.session.state = SessionState::Disconnected;
        self.session.breakpoints.clear();
        self.emitted.clear();
        if result.is_ok() {
            dprintln!("Detached from {}", self.endpoint);
        }
        result
    }
}

impl Drop for RemoteDebugController<'_> {
    fn drop(&mut self) {
        if self.conn.is_some() {
            if let Err(e) = self.disconnect() {
                wprintln!("detach from {} failed: {e}", self.endpoint);
            }
        }
    }
}

/// Next stop reply, skipping console output packets (`O<hex>`).
fn next_stop_reply(conn: &mut Connection) -> Result<Vec<u8>, HarnessError> {
    loop {
        let reply = conn.recv()?;
        if reply.first() == Some(&b'O') && reply != b"OK" {
            continue;
        }
        return Ok(reply);
    }
}

fn detach(conn: &mut Connection, session: &DebugSession) -> Result<(), HarnessError> {
    conn.set_reply_timeout(Some(REPLY_TIMEOUT))?;
    if session.state == SessionState::Running {
        conn.interrupt()?;
        next_stop_reply(conn)?;
    }
    for bp in &session.breakpoints {
        let reply = conn.request(&format!("z1,{:x},1", bp.address))?;
        if reply != b"OK" {
            wprintln!(
                "stub did not remove breakpoint at {:#x}: `{}`",
                bp.address,
                String::from_utf8_lossy(&reply)
            );
        }
    }
    conn.request("D")?;
    Ok(())
}
