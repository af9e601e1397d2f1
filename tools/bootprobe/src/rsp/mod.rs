//! GDB remote serial protocol client.
//!
//! Only what the harness needs: acknowledged packet exchange, the break
//! byte, and stop-reply parsing. Acknowledgement mode stays on for the whole
//! session; a `-` from the stub triggers a retransmit.

pub mod packet;
pub mod stop;

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::error::HarnessError;
use crate::verbose::vprintln;

use self::packet::{Frame, FrameReader};
pub use self::stop::StopReply;

/// Retransmits of one packet before giving up.
const MAX_RETRANSMITS: usize = 3;

/// Corrupt replies tolerated before giving up.
const MAX_BAD_REPLIES: usize = 3;

/// An open connection to a debug stub.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    reader: FrameReader<TcpStream>,
}

impl Connection {
    pub fn connect(endpoint: &str) -> io::Result<Self> {
        Self::from_stream(TcpStream::connect(endpoint)?)
    }

    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = FrameReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    /// A second handle on the socket, for use from another thread.
    pub fn try_clone_stream(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    /// `None` blocks indefinitely.
    pub fn set_reply_timeout(&self, timeout: Option<Duration>) -> Result<(), HarnessError> {
        self.stream.set_read_timeout(timeout).map_err(lost)
    }

    /// Send a packet and wait for the stub to acknowledge it.
    pub fn send(&mut self, payload: &str) -> Result<(), HarnessError> {
        vprintln!("  -> {payload}");
        let wire = packet::encode(payload.as_bytes());
        for _ in 0..=MAX_RETRANSMITS {
            self.stream.write_all(&wire).map_err(lost)?;
            loop {
                match self.reader.read_frame().map_err(|e| reading(e, payload))? {
                    Frame::Ack => return Ok(()),
                    Frame::Nack => break,
                    Frame::Interrupt => {}
                    Frame::Packet(p) => {
                        return Err(HarnessError::protocol(format!(
                            "expected acknowledgement of `{payload}`, got packet `{}`",
                            String::from_utf8_lossy(&p)
                        )));
                    }
                    Frame::Corrupt => {
                        return Err(HarnessError::protocol(format!(
                            "expected acknowledgement of `{payload}`, got a corrupt packet"
                        )));
                    }
                }
            }
        }
        Err(HarnessError::protocol(format!(
            "stub rejected `{payload}` {} times",
            MAX_RETRANSMITS + 1
        )))
    }

    /// Receive the next packet, acknowledging it.
    pub fn recv(&mut self) -> Result<Vec<u8>, HarnessError> {
        let mut bad = 0;
        loop {
            match self.reader.read_frame().map_err(|e| reading(e, "reply"))? {
                Frame::Packet(payload) => {
                    self.stream.write_all(b"+").map_err(lost)?;
                    vprintln!("  <- {}", String::from_utf8_lossy(&payload));
                    return Ok(payload);
                }
                Frame::Corrupt => {
                    bad += 1;
                    if bad > MAX_BAD_REPLIES {
                        return Err(HarnessError::protocol("repeated checksum mismatches"));
                    }
                    self.stream.write_all(b"-").map_err(lost)?;
                }
                Frame::Ack | Frame::Nack | Frame::Interrupt => {}
            }
        }
    }

    /// Send a packet and return the reply.
    pub fn request(&mut self, payload: &str) -> Result<Vec<u8>, HarnessError> {
        self.send(payload)?;
        self.recv()
    }

    /// Send the out-of-band break byte.
    pub fn interrupt(&mut self) -> Result<(), HarnessError> {
        vprintln!("  -> ^C");
        self.stream.write_all(&[packet::INTERRUPT]).map_err(lost)
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Map a socket failure on write or a non-timeout read.
fn lost(e: io::Error) -> HarnessError {
    HarnessError::ConnectionLost(e.to_string())
}

fn reading(e: io::Error, waiting_for: &str) -> HarnessError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            HarnessError::protocol(format!("stub did not answer `{waiting_for}` in time"))
        }
        io::ErrorKind::InvalidData => HarnessError::protocol(e.to_string()),
        io::ErrorKind::UnexpectedEof => {
            HarnessError::ConnectionLost("stub closed the connection".into())
        }
        _ => lost(e),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Seen, StubConn, spawn_stub};
    use super::*;

    #[test]
    fn request_round_trip() {
        let (endpoint, stub) = spawn_stub(|conn, seen| {
            seen.push(conn.next());
            conn.reply("OK");
        });
        let mut conn = Connection::connect(&endpoint).unwrap();
        assert_eq!(conn.request("Z1,ffffffff80001000,1").unwrap(), b"OK");
        assert_eq!(
            stub.join().unwrap(),
            [Seen::Packet("Z1,ffffffff80001000,1".into())]
        );
    }

    /// Record everything until the client hangs up.
    fn drain(conn: &mut StubConn, seen: &mut Vec<Seen>) {
        loop {
            let msg = conn.next();
            let closed = msg == Seen::Closed;
            seen.push(msg);
            if closed {
                break;
            }
        }
    }

    #[test]
    fn nack_causes_retransmit() {
        let (endpoint, stub) = spawn_stub(|conn, seen| {
            // Reject the first copy.
            conn.raw(b"-");
            seen.push(conn.next());
            conn.reply("S05");
            drain(conn, seen);
        });
        let mut conn = Connection::connect(&endpoint).unwrap();
        assert_eq!(conn.request("?").unwrap(), b"S05");
        drop(conn);
        assert_eq!(
            stub.join().unwrap(),
            [Seen::Packet("?".into()), Seen::Packet("?".into()), Seen::Closed]
        );
    }

    #[test]
    fn corrupt_reply_is_nacked_and_resent() {
        let (endpoint, stub) = spawn_stub(|conn, seen| {
            seen.push(conn.next());
            conn.raw(b"$OK#00");
            conn.reply("OK");
            drain(conn, seen);
        });
        let mut conn = Connection::connect(&endpoint).unwrap();
        assert_eq!(conn.request("D").unwrap(), b"OK");
        drop(conn);
        assert_eq!(stub.join().unwrap(), [Seen::Packet("D".into()), Seen::Closed]);
    }

    #[test]
    fn closed_stub_is_connection_lost() {
        let (endpoint, stub) = spawn_stub(|conn, seen| {
            seen.push(conn.next());
        });
        let mut conn = Connection::connect(&endpoint).unwrap();
        let err = conn.request("c").unwrap_err();
        assert!(matches!(err, HarnessError::ConnectionLost(_)), "{err}");
        stub.join().unwrap();
    }

    #[test]
    fn silent_stub_is_protocol_error() {
        let (endpoint, stub) = spawn_stub(|conn, seen| {
            seen.push(conn.next());
            std::thread::sleep(Duration::from_millis(500));
        });
        let mut conn = Connection::connect(&endpoint).unwrap();
        conn.set_reply_timeout(Some(Duration::from_millis(100))).unwrap();
        let err = conn.request("?").unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)), "{err}");
        stub.join().unwrap();
    }
}
