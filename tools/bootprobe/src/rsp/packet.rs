//! Packet framing: `$<payload>#<checksum>`.
//!
//! `#`, `$`, `}` and `*` inside a payload are escaped as `}` followed by the
//! byte xor 0x20. Replies may use run-length encoding, where `X*n` repeats
//! `X` a further `n - 29` times. The checksum covers the bytes as sent.

use std::io::{self, Read};

/// Byte the stub interprets as a break request outside any packet.
pub const INTERRUPT: u8 = 0x03;

const ESCAPE: u8 = b'}';
const RLE: u8 = b'*';

/// Modulo-256 sum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

fn needs_escape(b: u8) -> bool {
    matches!(b, b'#' | b'$' | ESCAPE | RLE)
}

/// Frame `payload` for the wire.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len());
    for &b in payload {
        if needs_escape(b) {
            body.extend([ESCAPE, b ^ 0x20]);
        } else {
            body.push(b);
        }
    }

    let mut out = Vec::with_capacity(body.len() + 4);
    out.push(b'$');
    out.extend_from_slice(&body);
    out.extend(format!("#{:02x}", checksum(&body)).bytes());
    out
}

/// Undo escaping and run-length encoding.
pub fn decode(body: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.iter().copied();
    while let Some(b) = bytes.next() {
        match b {
            ESCAPE => {
                let next = bytes.next().ok_or("escape at end of packet")?;
                out.push(next ^ 0x20);
            }
            RLE => {
                let count = bytes.next().ok_or("run length at end of packet")?;
                let &last = out.last().ok_or("run length with nothing to repeat")?;
                let repeat = count
                    .checked_sub(29)
                    .ok_or_else(|| format!("invalid run length byte {count:#04x}"))?;
                out.extend(std::iter::repeat_n(last, usize::from(repeat)));
            }
            _ => out.push(b),
        }
    }
    Ok(out)
}

/// One unit read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nack,
    Interrupt,
    /// A packet whose checksum matched, already decoded.
    Packet(Vec<u8>),
    /// A packet whose checksum did not match.
    Corrupt,
}

/// Reads frames from a byte stream, skipping noise between them.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn byte(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_frame(&mut self) -> io::Result<Frame> {
        loop {
            match self.byte()? {
                b'+' => return Ok(Frame::Ack),
                b'-' => return Ok(Frame::Nack),
                INTERRUPT => return Ok(Frame::Interrupt),
                b'$' => return self.read_packet(),
                _ => {}
            }
        }
    }

    fn read_packet(&mut self) -> io::Result<Frame> {
        let mut body = Vec::new();
        loop {
            match self.byte()? {
                b'#' => break,
                ESCAPE => {
                    // Keep the escaped byte raw so a literal `#` is not taken
                    // as the terminator.
                    body.push(ESCAPE);
                    body.push(self.byte()?);
                }
                b => body.push(b),
            }
        }

        let sum = [self.byte()?, self.byte()?];
        let expected = std::str::from_utf8(&sum)
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok());
        if expected != Some(checksum(&body)) {
            return Ok(Frame::Corrupt);
        }

        decode(&body)
            .map(Frame::Packet)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Parse a big-endian hex number such as an address or signal.
pub fn parse_hex(text: &[u8]) -> Option<u64> {
    if text.is_empty() || text.len() > 16 {
        return None;
    }
    u64::from_str_radix(std::str::from_utf8(text).ok()?, 16).ok()
}

/// Decode a register value sent as target-order (little-endian) hex bytes.
pub fn parse_le_register(text: &[u8]) -> Option<u64> {
    if text.is_empty() || text.len() % 2 != 0 || text.len() > 16 {
        return None;
    }
    text.chunks(2).rev().try_fold(0u64, |acc, pair| {
        let byte = u8::try_from(parse_hex(pair)?).ok()?;
        Some((acc << 8) | u64::from(byte))
    })
}
