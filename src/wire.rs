//! RFC 1350 packet marshalling.
//!
//! All multi-byte fields are big-endian. The five packet types are:
//!
//! | Opcode | Packet | Body                                  |
//! |--------|--------|---------------------------------------|
//! | 1      | RRQ    | filename NUL mode NUL                 |
//! | 2      | WRQ    | filename NUL mode NUL                 |
//! | 3      | DATA   | block# (2B), up to 512 payload bytes  |
//! | 4      | ACK    | block# (2B)                           |
//! | 5      | ERROR  | error code (2B), message NUL          |

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// RFC 1350 maximum data payload per block.
pub const BLOCK_LEN: usize = 512;
/// Opcode plus block number.
pub const DATA_HEADER_LEN: usize = 4;
/// The largest datagram this server will accept or emit.
pub const MAX_DATA_PACKET: usize = DATA_HEADER_LEN + BLOCK_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl TryFrom<u16> for Opcode {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            _ => Err(FrameError::BadOpcode(value)),
        }
    }
}

/// RFC 1350 transfer modes. Mode strings are matched case-insensitively;
/// MAIL is accepted on the wire but only valid for write requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Netascii,
    #[default]
    Octet,
    Mail,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Some(Mode::Netascii),
            "octet" => Some(Mode::Octet),
            "mail" => Some(Mode::Mail),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Netascii => "netascii",
            Mode::Octet => "octet",
            Mode::Mail => "mail",
        }
    }
}

/// RFC 1350 error conditions. `TimedOut` is an alias that goes to the wire
/// as code 0 with its own message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
    TimedOut,
}

impl ErrorCode {
    pub fn wire_code(self) -> u16 {
        match self {
            ErrorCode::NotDefined | ErrorCode::TimedOut => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not implemented.",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "No space available.",
            ErrorCode::IllegalOperation => "Illegal operation.",
            ErrorCode::UnknownTid => "Unknown TID.",
            ErrorCode::FileAlreadyExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
            ErrorCode::TimedOut => "Timed Out",
        }
    }
}

/// A reason a datagram failed to parse. The engine answers every variant
/// with ILLEGAL_OPERATION.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("datagram shorter than its header")]
    Truncated,
    #[error("datagram exceeds the {MAX_DATA_PACKET}-byte maximum")]
    Oversize,
    #[error("unknown opcode {0}")]
    BadOpcode(u16),
    #[error("request field is missing its NUL terminator")]
    UnterminatedField,
    #[error("empty request field")]
    EmptyField,
    #[error("request field is not valid text")]
    BadEncoding,
    #[error("unknown transfer mode {0:?}")]
    BadMode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq { filename: String, mode: Mode },
    Wrq { filename: String, mode: Mode },
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: u16, message: String },
}

impl Packet {
    /// Builds an ERROR packet carrying the canonical message for `code`.
    pub fn error(code: ErrorCode) -> Packet {
        Packet::Error {
            code: code.wire_code(),
            message: code.message().to_string(),
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Packet, FrameError> {
        if buf.len() > MAX_DATA_PACKET {
            return Err(FrameError::Oversize);
        }
        if buf.len() < 2 {
            return Err(FrameError::Truncated);
        }

        let opcode = Opcode::try_from(u16::from_be_bytes([buf[0], buf[1]]))?;
        let body = &buf[2..];

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let mut rest = body;
                let filename = take_cstr(&mut rest)?.to_string();
                let mode_str = take_cstr(&mut rest)?;
                let mode =
                    Mode::parse(mode_str).ok_or_else(|| FrameError::BadMode(mode_str.into()))?;
                match opcode {
                    Opcode::Rrq => Ok(Packet::Rrq { filename, mode }),
                    _ => Ok(Packet::Wrq { filename, mode }),
                }
            }
            Opcode::Data => {
                if buf.len() < DATA_HEADER_LEN {
                    return Err(FrameError::Truncated);
                }
                Ok(Packet::Data {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                    payload: Bytes::copy_from_slice(&buf[DATA_HEADER_LEN..]),
                })
            }
            Opcode::Ack => {
                if buf.len() < DATA_HEADER_LEN {
                    return Err(FrameError::Truncated);
                }
                Ok(Packet::Ack {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                })
            }
            Opcode::Error => {
                if buf.len() < DATA_HEADER_LEN {
                    return Err(FrameError::Truncated);
                }
                let code = u16::from_be_bytes([buf[2], buf[3]]);
                // Peer error messages are display-only; take what is there,
                // terminator or not.
                let msg = &buf[DATA_HEADER_LEN..];
                let msg = match msg.iter().position(|&b| b == 0) {
                    Some(pos) => &msg[..pos],
                    None => msg,
                };
                Ok(Packet::Error {
                    code,
                    message: String::from_utf8_lossy(msg).into_owned(),
                })
            }
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(MAX_DATA_PACKET);
        match self {
            Packet::Rrq { filename, mode } | Packet::Wrq { filename, mode } => {
                let opcode = match self {
                    Packet::Rrq { .. } => Opcode::Rrq,
                    _ => Opcode::Wrq,
                };
                out.put_u16(opcode as u16);
                out.put_slice(filename.as_bytes());
                out.put_u8(0);
                out.put_slice(mode.as_str().as_bytes());
                out.put_u8(0);
            }
            Packet::Data { block, payload } => {
                out.put_u16(Opcode::Data as u16);
                out.put_u16(*block);
                out.put_slice(payload);
            }
            Packet::Ack { block } => {
                out.put_u16(Opcode::Ack as u16);
                out.put_u16(*block);
            }
            Packet::Error { code, message } => {
                out.put_u16(Opcode::Error as u16);
                out.put_u16(*code);
                out.put_slice(message.as_bytes());
                out.put_u8(0);
            }
        }
        out
    }
}

/// Splits a NUL-terminated field off the front of `buf`. Empty fields and
/// fields without a terminator are request-framing failures.
fn take_cstr<'a>(buf: &mut &'a [u8]) -> Result<&'a str, FrameError> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(FrameError::UnterminatedField)?;
    let (field, rest) = buf.split_at(pos);
    *buf = &rest[1..];
    if field.is_empty() {
        return Err(FrameError::EmptyField);
    }
    std::str::from_utf8(field).map_err(|_| FrameError::BadEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(opcode: u16, filename: &[u8], mode: &[u8]) -> Vec<u8> {
        let mut buf = opcode.to_be_bytes().to_vec();
        buf.extend_from_slice(filename);
        buf.push(0);
        buf.extend_from_slice(mode);
        buf.push(0);
        buf
    }

    #[test]
    fn parses_rrq() {
        let packet = Packet::parse(&request(1, b"boot/pxelinux.0", b"octet")).unwrap();
        assert_eq!(
            packet,
            Packet::Rrq {
                filename: "boot/pxelinux.0".into(),
                mode: Mode::Octet,
            }
        );
    }

    #[test]
    fn parses_wrq_with_mixed_case_mode() {
        let packet = Packet::parse(&request(2, b"upload.bin", b"NetASCII")).unwrap();
        assert_eq!(
            packet,
            Packet::Wrq {
                filename: "upload.bin".into(),
                mode: Mode::Netascii,
            }
        );
    }

    #[test]
    fn rejects_unknown_mode() {
        assert_eq!(
            Packet::parse(&request(1, b"f", b"binary")),
            Err(FrameError::BadMode("binary".into()))
        );
    }

    #[test]
    fn rejects_missing_terminator() {
        let mut buf = request(1, b"f", b"octet");
        buf.pop();
        assert_eq!(Packet::parse(&buf), Err(FrameError::UnterminatedField));
    }

    #[test]
    fn rejects_empty_fields() {
        assert_eq!(
            Packet::parse(&request(1, b"", b"octet")),
            Err(FrameError::EmptyField)
        );
        assert_eq!(
            Packet::parse(&request(2, b"f", b"")),
            Err(FrameError::EmptyField)
        );
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert_eq!(
            Packet::parse(&[0x00, 0x09, 0x00, 0x00]),
            Err(FrameError::BadOpcode(9))
        );
    }

    #[test]
    fn rejects_short_and_oversize_datagrams() {
        assert_eq!(Packet::parse(&[0x00]), Err(FrameError::Truncated));
        assert_eq!(Packet::parse(&[0x00, 0x03, 0x00]), Err(FrameError::Truncated));
        let oversize = vec![0u8; MAX_DATA_PACKET + 1];
        assert_eq!(Packet::parse(&oversize), Err(FrameError::Oversize));
    }

    #[test]
    fn data_roundtrip() {
        let packet = Packet::Data {
            block: 0x1234,
            payload: Bytes::from_static(b"\xde\xad\xbe\xef"),
        };
        let bytes = packet.to_bytes();
        assert_eq!(&bytes[..4], &[0x00, 0x03, 0x12, 0x34]);
        assert_eq!(Packet::parse(&bytes).unwrap(), packet);
    }

    #[test]
    fn empty_data_block_is_valid() {
        let packet = Packet::parse(&[0x00, 0x03, 0x00, 0x01]).unwrap();
        assert_eq!(
            packet,
            Packet::Data {
                block: 1,
                payload: Bytes::new(),
            }
        );
    }

    #[test]
    fn ack_roundtrip() {
        let packet = Packet::Ack { block: 65535 };
        assert_eq!(Packet::parse(&packet.to_bytes()).unwrap(), packet);
    }

    #[test]
    fn error_carries_canonical_message() {
        let bytes = Packet::error(ErrorCode::UnknownTid).to_bytes();
        assert_eq!(&bytes[..4], &[0x00, 0x05, 0x00, 0x05]);
        match Packet::parse(&bytes).unwrap() {
            Packet::Error { code, message } => {
                assert_eq!(code, 5);
                assert_eq!(message, "Unknown TID.");
            }
            other => panic!("expected error packet, got {other:?}"),
        }
    }

    #[test]
    fn timed_out_is_reported_as_code_zero() {
        let bytes = Packet::error(ErrorCode::TimedOut).to_bytes();
        assert_eq!(&bytes[..4], &[0x00, 0x05, 0x00, 0x00]);
        assert!(bytes.ends_with(b"Timed Out\0"));
    }
}
