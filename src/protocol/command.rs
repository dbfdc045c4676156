//! SmartPort command and status codes.
//!
//! Packet header (after SLIP unescaping):
//! ```text
//! ┌──────────┬──────────────────┬─────────────────────┐
//! │ Seq      │ Command / Status │ Payload             │
//! │ 1 byte   │ 1 byte           │ command-dependent   │
//! └──────────┴──────────────────┴─────────────────────┘
//! ```
//!
//! Multi-byte fields inside payloads are little endian, as on the bus.

use std::fmt;

/// Packet header size in bytes (sequence number + command/status).
pub const HEADER_SIZE: usize = 2;

/// Size of one SmartPort block.
pub const BLOCK_SIZE: usize = 512;

/// SmartPort commands understood by the packet layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Status = 0x00,
    ReadBlock = 0x01,
    WriteBlock = 0x02,
    Format = 0x03,
    Control = 0x04,
    Init = 0x05,
    Open = 0x06,
    Close = 0x07,
    Read = 0x08,
    Write = 0x09,
}

impl Command {
    /// Every known command, in code order.
    pub const ALL: [Command; 10] = [
        Command::Status,
        Command::ReadBlock,
        Command::WriteBlock,
        Command::Format,
        Command::Control,
        Command::Init,
        Command::Open,
        Command::Close,
        Command::Read,
        Command::Write,
    ];

    /// Look up a command by wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Wire code of this command.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Minimum payload length after the header (unit byte included).
    pub fn min_payload_len(self) -> usize {
        match self {
            Command::Status => 2,
            Command::ReadBlock => 4,
            Command::WriteBlock => 4 + BLOCK_SIZE,
            Command::Control => 2,
            Command::Format | Command::Init | Command::Open | Command::Close => 1,
            Command::Read | Command::Write => 6,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Status => "STATUS",
            Command::ReadBlock => "READBLOCK",
            Command::WriteBlock => "WRITEBLOCK",
            Command::Format => "FORMAT",
            Command::Control => "CONTROL",
            Command::Init => "INIT",
            Command::Open => "OPEN",
            Command::Close => "CLOSE",
            Command::Read => "READ",
            Command::Write => "WRITE",
        };
        f.write_str(name)
    }
}

/// Response status byte.
///
/// Zero is success; the other values follow SmartPort error numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u8);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(0x00);
    /// Command not supported by the target.
    pub const BAD_COMMAND: StatusCode = StatusCode(0x01);
    pub const BAD_PARAMETER_COUNT: StatusCode = StatusCode(0x04);
    /// Bus communication error (bad checksum).
    pub const BUS_ERROR: StatusCode = StatusCode(0x06);
    pub const BAD_UNIT: StatusCode = StatusCode(0x11);
    pub const BAD_CONTROL: StatusCode = StatusCode(0x21);
    pub const IO_ERROR: StatusCode = StatusCode(0x27);
    pub const NO_DRIVE: StatusCode = StatusCode(0x28);
    pub const WRITE_PROTECTED: StatusCode = StatusCode(0x2B);
    pub const BAD_BLOCK: StatusCode = StatusCode(0x2D);
    /// Device not ready.
    pub const OFFLINE: StatusCode = StatusCode(0x2F);

    /// Check for the success status.
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Raw status byte.
    #[inline]
    pub fn code(self) -> u8 {
        self.0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::OK => "OK",
            Self::BAD_COMMAND => "BAD_COMMAND",
            Self::BAD_PARAMETER_COUNT => "BAD_PARAMETER_COUNT",
            Self::BUS_ERROR => "BUS_ERROR",
            Self::BAD_UNIT => "BAD_UNIT",
            Self::BAD_CONTROL => "BAD_CONTROL",
            Self::IO_ERROR => "IO_ERROR",
            Self::NO_DRIVE => "NO_DRIVE",
            Self::WRITE_PROTECTED => "WRITE_PROTECTED",
            Self::BAD_BLOCK => "BAD_BLOCK",
            Self::OFFLINE => "OFFLINE",
            _ => return write!(f, "STATUS({:#04x})", self.0),
        };
        f.write_str(name)
    }
}

/// Read a 24-bit little-endian value.
#[inline]
pub(crate) fn read_u24(bytes: &[u8]) -> u32 {
    u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16
}

/// Write the low 24 bits of `value`, little endian.
#[inline]
pub(crate) fn u24_bytes(value: u32) -> [u8; 3] {
    let b = value.to_le_bytes();
    [b[0], b[1], b[2]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_round_trip() {
        for command in Command::ALL {
            assert_eq!(Command::from_code(command.code()), Some(command));
        }
    }

    #[test]
    fn test_unknown_command_code() {
        assert_eq!(Command::from_code(0x0A), None);
        assert_eq!(Command::from_code(0xFE), None);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StatusCode::BAD_COMMAND.to_string(), "BAD_COMMAND");
        assert_eq!(StatusCode(0x99).to_string(), "STATUS(0x99)");
        assert!(StatusCode::OK.is_ok());
        assert!(!StatusCode::OFFLINE.is_ok());
    }

    #[test]
    fn test_u24_helpers() {
        assert_eq!(u24_bytes(0x12_3456), [0x56, 0x34, 0x12]);
        assert_eq!(read_u24(&[0x56, 0x34, 0x12]), 0x12_3456);
        // Upper byte is dropped.
        assert_eq!(u24_bytes(0xFF00_0001), [0x01, 0x00, 0x00]);
    }
}
