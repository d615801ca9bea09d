//! TFTP wire format
//! RFC 1350 (base protocol), RFC 2347 (option extension), RFC 2348 (blksize),
//! RFC 2349 (tsize), RFC 7440 (windowsize)
//!
//! Format:
//! ```text
//! RRQ/WRQ  [opcode (2)][filename][0][mode][0]{[option][0][value][0]}
//! DATA     [opcode (2)][block (2)][data (0..blksize)]
//! ACK      [opcode (2)][block (2)]
//! ERROR    [opcode (2)][code (2)][message][0]
//! OACK     [opcode (2)]{[option][0][value][0]}
//! ```
//!
//! `rollover` is a non-standard option: value 0 or 1 names the block
//! number that follows 65535.

use alloc::string::ToString;
use alloc::vec::Vec;
use core::fmt;
use core::str;

use crate::net::config::Rollover;

pub mod opcode {
    pub const RRQ: u16 = 1;
    pub const WRQ: u16 = 2;
    pub const DATA: u16 = 3;
    pub const ACK: u16 = 4;
    pub const ERROR: u16 = 5;
    pub const OACK: u16 = 6;
}

/// ERROR packet codes
pub mod error_code {
    pub const NOT_DEFINED: u16 = 0;
    pub const FILE_NOT_FOUND: u16 = 1;
    pub const ACCESS_VIOLATION: u16 = 2;
    pub const DISK_FULL: u16 = 3;
    pub const ILLEGAL_OPERATION: u16 = 4;
    pub const UNKNOWN_TID: u16 = 5;
    pub const FILE_EXISTS: u16 = 6;
    pub const NO_SUCH_USER: u16 = 7;
    pub const OPTION_REFUSED: u16 = 8;
}

pub const MODE_OCTET: &str = "octet";

/// Block size without the blksize option
pub const DEFAULT_BLKSIZE: u16 = 512;
pub const MIN_BLKSIZE: u16 = 8;
pub const MAX_BLKSIZE: u16 = 65464;

/// Opcode plus block number
pub const DATA_HEADER_SIZE: usize = 4;

const OPT_BLKSIZE: &str = "blksize";
const OPT_TSIZE: &str = "tsize";
const OPT_WINDOWSIZE: &str = "windowsize";
const OPT_ROLLOVER: &str = "rollover";

/// TFTP parse errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TftpParseError {
    PacketTooShort,
    UnknownOpcode(u16),
    /// A string field is missing its NUL terminator
    Unterminated,
    InvalidUtf8,
    /// An option value is out of range or not a number
    BadOption,
}

impl fmt::Display for TftpParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TftpParseError::PacketTooShort => write!(f, "TFTP packet too short"),
            TftpParseError::UnknownOpcode(op) => write!(f, "Unknown TFTP opcode {}", op),
            TftpParseError::Unterminated => write!(f, "Unterminated TFTP string"),
            TftpParseError::InvalidUtf8 => write!(f, "TFTP string is not UTF-8"),
            TftpParseError::BadOption => write!(f, "Bad TFTP option value"),
        }
    }
}

/// Negotiable options; `None` means not present
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TftpOptions {
    pub blksize: Option<u16>,
    pub tsize: Option<u64>,
    pub windowsize: Option<u16>,
    pub rollover: Option<Rollover>,
}

impl TftpOptions {
    fn parse(mut fields: Fields<'_>) -> Result<Self, TftpParseError> {
        let mut options = TftpOptions::default();
        while let Some(name) = fields.next_str()? {
            let value = fields.next_str()?.ok_or(TftpParseError::Unterminated)?;
            if name.eq_ignore_ascii_case(OPT_BLKSIZE) {
                let size: u16 = number(value)?;
                if !(MIN_BLKSIZE..=MAX_BLKSIZE).contains(&size) {
                    return Err(TftpParseError::BadOption);
                }
                options.blksize = Some(size);
            } else if name.eq_ignore_ascii_case(OPT_TSIZE) {
                options.tsize = Some(number(value)?);
            } else if name.eq_ignore_ascii_case(OPT_WINDOWSIZE) {
                let window: u16 = number(value)?;
                if window == 0 {
                    return Err(TftpParseError::BadOption);
                }
                options.windowsize = Some(window);
            } else if name.eq_ignore_ascii_case(OPT_ROLLOVER) {
                options.rollover = Some(match number::<u8>(value)? {
                    0 => Rollover::Zero,
                    1 => Rollover::One,
                    _ => return Err(TftpParseError::BadOption),
                });
            }
            // Unknown options are not acknowledged and not acted on
        }
        Ok(options)
    }

    fn write(&self, out: &mut Vec<u8>) {
        let mut pair = |name: &str, value: u64| {
            put_str(out, name);
            put_str(out, &value.to_string());
        };
        if let Some(size) = self.blksize {
            pair(OPT_BLKSIZE, size as u64);
        }
        if let Some(tsize) = self.tsize {
            pair(OPT_TSIZE, tsize);
        }
        if let Some(window) = self.windowsize {
            pair(OPT_WINDOWSIZE, window as u64);
        }
        if let Some(rollover) = self.rollover {
            pair(OPT_ROLLOVER, rollover.first_block() as u64);
        }
    }
}

fn number<T: str::FromStr>(text: &str) -> Result<T, TftpParseError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TftpParseError::BadOption);
    }
    text.parse().map_err(|_| TftpParseError::BadOption)
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

/// Cursor over NUL-terminated strings
struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    fn next_str(&mut self) -> Result<Option<&'a str>, TftpParseError> {
        if self.rest.is_empty() {
            return Ok(None);
        }
        let end = self
            .rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(TftpParseError::Unterminated)?;
        let field = str::from_utf8(&self.rest[..end]).map_err(|_| TftpParseError::InvalidUtf8)?;
        self.rest = &self.rest[end + 1..];
        Ok(Some(field))
    }
}

/// A parsed TFTP packet borrowing from the datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TftpPacket<'a> {
    ReadRequest {
        filename: &'a str,
        mode: &'a str,
        options: TftpOptions,
    },
    WriteRequest {
        filename: &'a str,
        mode: &'a str,
        options: TftpOptions,
    },
    Data {
        block: u16,
        data: &'a [u8],
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: &'a str,
    },
    OptionAck(TftpOptions),
}

impl<'a> TftpPacket<'a> {
    /// Parse a UDP payload
    pub fn parse(bytes: &'a [u8]) -> Result<Self, TftpParseError> {
        if bytes.len() < 2 {
            return Err(TftpParseError::PacketTooShort);
        }
        let op = u16::from_be_bytes([bytes[0], bytes[1]]);
        let body = &bytes[2..];
        let block = || {
            body.get(..2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or(TftpParseError::PacketTooShort)
        };

        match op {
            opcode::RRQ | opcode::WRQ => {
                let mut fields = Fields { rest: body };
                let filename = fields.next_str()?.ok_or(TftpParseError::PacketTooShort)?;
                let mode = fields.next_str()?.ok_or(TftpParseError::PacketTooShort)?;
                let options = TftpOptions::parse(fields)?;
                Ok(if op == opcode::RRQ {
                    TftpPacket::ReadRequest {
                        filename,
                        mode,
                        options,
                    }
                } else {
                    TftpPacket::WriteRequest {
                        filename,
                        mode,
                        options,
                    }
                })
            }
            opcode::DATA => Ok(TftpPacket::Data {
                block: block()?,
                data: &body[2..],
            }),
            opcode::ACK => Ok(TftpPacket::Ack { block: block()? }),
            opcode::ERROR => {
                let code = block()?;
                // Some servers omit the terminator on the last string
                let text = &body[2..];
                let text = text.strip_suffix(&[0]).unwrap_or(text);
                // Servers in the wild send Latin-1 messages; keep what decodes
                let message = match str::from_utf8(text) {
                    Ok(message) => message,
                    Err(e) => str::from_utf8(&text[..e.valid_up_to()]).unwrap_or_default(),
                };
                Ok(TftpPacket::Error { code, message })
            }
            opcode::OACK => Ok(TftpPacket::OptionAck(TftpOptions::parse(Fields {
                rest: body,
            })?)),
            other => Err(TftpParseError::UnknownOpcode(other)),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            TftpPacket::ReadRequest {
                filename,
                mode,
                options,
            }
            | TftpPacket::WriteRequest {
                filename,
                mode,
                options,
            } => {
                let op = match self {
                    TftpPacket::ReadRequest { .. } => opcode::RRQ,
                    _ => opcode::WRQ,
                };
                out.extend_from_slice(&op.to_be_bytes());
                put_str(&mut out, filename);
                put_str(&mut out, mode);
                options.write(&mut out);
            }
            TftpPacket::Data { block, data } => {
                out.reserve(DATA_HEADER_SIZE + data.len());
                out.extend_from_slice(&opcode::DATA.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(data);
            }
            TftpPacket::Ack { block } => {
                out.extend_from_slice(&opcode::ACK.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
            }
            TftpPacket::Error { code, message } => {
                out.extend_from_slice(&opcode::ERROR.to_be_bytes());
                out.extend_from_slice(&code.to_be_bytes());
                put_str(&mut out, message);
            }
            TftpPacket::OptionAck(options) => {
                out.extend_from_slice(&opcode::OACK.to_be_bytes());
                options.write(&mut out);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let options = TftpOptions {
            blksize: Some(1468),
            tsize: Some(0),
            windowsize: Some(8),
            rollover: Some(Rollover::Zero),
        };
        let bytes = TftpPacket::ReadRequest {
            filename: "boot.img",
            mode: MODE_OCTET,
            options,
        }
        .to_bytes();
        let expected: &[u8] =
            b"\x00\x01boot.img\0octet\0blksize\01468\0tsize\00\0windowsize\08\0rollover\00\0";
        assert_eq!(bytes, expected);

        match TftpPacket::parse(&bytes).unwrap() {
            TftpPacket::ReadRequest {
                filename,
                options: parsed,
                ..
            } => {
                assert_eq!(filename, "boot.img");
                assert_eq!(parsed, options);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_oack_names_case_insensitive() {
        let bytes = b"\x00\x06BLKSIZE\01024\0WindowSize\04\0";
        let parsed = TftpPacket::parse(bytes).unwrap();
        assert_eq!(
            parsed,
            TftpPacket::OptionAck(TftpOptions {
                blksize: Some(1024),
                windowsize: Some(4),
                ..TftpOptions::default()
            })
        );
    }

    #[test]
    fn test_oack_value_checks() {
        assert_eq!(
            TftpPacket::parse(b"\x00\x06blksize\04\0"),
            Err(TftpParseError::BadOption)
        );
        assert_eq!(
            TftpPacket::parse(b"\x00\x06rollover\02\0"),
            Err(TftpParseError::BadOption)
        );
        assert_eq!(
            TftpPacket::parse(b"\x00\x06windowsize\0-1\0"),
            Err(TftpParseError::BadOption)
        );
        assert_eq!(
            TftpPacket::parse(b"\x00\x06blksize\0512"),
            Err(TftpParseError::Unterminated)
        );
    }

    #[test]
    fn test_data_and_error() {
        let data = TftpPacket::Data {
            block: 3,
            data: b"abc",
        }
        .to_bytes();
        assert_eq!(data, b"\x00\x03\x00\x03abc");
        assert_eq!(
            TftpPacket::parse(&data),
            Ok(TftpPacket::Data {
                block: 3,
                data: b"abc"
            })
        );

        assert_eq!(
            TftpPacket::parse(b"\x00\x05\x00\x01File not found\0"),
            Ok(TftpPacket::Error {
                code: error_code::FILE_NOT_FOUND,
                message: "File not found"
            })
        );
        assert_eq!(
            TftpPacket::parse(b"\x00\x05\x00\x01Fichier non trouv\xe9\0"),
            Ok(TftpPacket::Error {
                code: error_code::FILE_NOT_FOUND,
                message: "Fichier non trouv"
            })
        );
        assert_eq!(
            TftpPacket::parse(b"\x00\x09"),
            Err(TftpParseError::UnknownOpcode(9))
        );
        assert_eq!(TftpPacket::parse(b"\x00\x04\x00"), Err(TftpParseError::PacketTooShort));
    }
}
