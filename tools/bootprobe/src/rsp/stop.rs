//! Stop-reply packets (`S`, `T`, `W`, `X`).

use super::packet::{parse_hex, parse_le_register};

/// Register number of `rip` in the x86_64 target description.
pub const PC_REGISTER: u8 = 0x10;

/// Why the target stopped, as reported by the stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReply {
    /// The target halted and can be resumed.
    Signal {
        signal: u8,
        /// Program counter, when the stub included it.
        pc: Option<u64>,
        /// The stub says a hardware breakpoint caused the stop.
        hw_break: bool,
    },
    /// The target process exited.
    Exited { code: u8 },
    /// The target was killed by a signal.
    Terminated { signal: u8 },
}

impl StopReply {
    /// Parse a stop reply; `Err` carries a description of what was wrong.
    pub fn parse(payload: &[u8]) -> Result<Self, String> {
        let describe = || String::from_utf8_lossy(payload).into_owned();
        let (&kind, rest) = payload
            .split_first()
            .ok_or_else(|| "empty stop reply".to_owned())?;
        let code = rest
            .get(..2)
            .and_then(parse_hex)
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| format!("malformed stop reply `{}`", describe()))?;

        match kind {
            b'S' => Ok(Self::Signal {
                signal: code,
                pc: None,
                hw_break: false,
            }),
            b'T' => {
                let mut pc = None;
                let mut hw_break = false;
                for field in rest[2..].split(|&b| b == b';').filter(|f| !f.is_empty()) {
                    let Some(colon) = field.iter().position(|&b| b == b':') else {
                        continue;
                    };
                    let (key, value) = (&field[..colon], &field[colon + 1..]);
                    if key == b"hwbreak" {
                        hw_break = true;
                    } else if parse_hex(key) == Some(u64::from(PC_REGISTER)) {
                        pc = parse_le_register(value);
                    }
                }
                Ok(Self::Signal {
                    signal: code,
                    pc,
                    hw_break,
                })
            }
            b'W' => Ok(Self::Exited { code }),
            b'X' => Ok(Self::Terminated { signal: code }),
            _ => Err(format!("unexpected stop reply `{}`", describe())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_signal() {
        assert_eq!(
            StopReply::parse(b"S05"),
            Ok(StopReply::Signal {
                signal: 5,
                pc: None,
                hw_break: false
            })
        );
    }

    #[test]
    fn t_packet_with_pc_and_hwbreak() {
        let reply = StopReply::parse(b"T05hwbreak:;10:0010000080ffffff;thread:p01.01;").unwrap();
        assert_eq!(
            reply,
            StopReply::Signal {
                signal: 5,
                pc: Some(0xffff_ff80_0000_1000),
                hw_break: true,
            }
        );
    }

    #[test]
    fn t_packet_without_pc() {
        assert_eq!(
            StopReply::parse(b"T02thread:01;"),
            Ok(StopReply::Signal {
                signal: 2,
                pc: None,
                hw_break: false
            })
        );
    }

    #[test]
    fn exit_and_termination() {
        assert_eq!(StopReply::parse(b"W00"), Ok(StopReply::Exited { code: 0 }));
        assert_eq!(StopReply::parse(b"X09"), Ok(StopReply::Terminated { signal: 9 }));
    }

    #[test]
    fn malformed_replies() {
        assert!(StopReply::parse(b"").is_err());
        assert!(StopReply::parse(b"T").is_err());
        assert!(StopReply::parse(b"E01").is_err());
        assert!(StopReply::parse(b"Qzz").is_err());
    }
}
