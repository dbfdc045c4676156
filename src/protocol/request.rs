//! Request packets.
//!
//! Requests are a closed set of variants, one per SmartPort command, plus
//! [`RequestBody::Unknown`] for well-formed packets carrying a command code
//! outside the table. Unknown commands are answered, not dropped.

use bytes::{BufMut, Bytes, BytesMut};

use super::command::{read_u24, u24_bytes, Command, BLOCK_SIZE, HEADER_SIZE};
use crate::error::PacketError;

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Sequence number chosen by the host; echoed in the response.
    pub sequence_number: u8,
    /// Command-specific fields.
    pub body: RequestBody,
}

/// Command-specific request fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Status { unit: u8, status_code: u8 },
    ReadBlock { unit: u8, block: u32 },
    WriteBlock { unit: u8, block: u32, data: Bytes },
    Format { unit: u8 },
    Control { unit: u8, control_code: u8, data: Bytes },
    Init { unit: u8 },
    Open { unit: u8 },
    Close { unit: u8 },
    Read { unit: u8, byte_count: u16, address: u32 },
    Write { unit: u8, byte_count: u16, address: u32, data: Bytes },
    /// Command code outside the SmartPort table.
    Unknown { command: u8, payload: Bytes },
}

impl Request {
    /// Create a request.
    pub fn new(sequence_number: u8, body: RequestBody) -> Self {
        Self {
            sequence_number,
            body,
        }
    }

    /// Decode a complete, unescaped frame.
    ///
    /// # Errors
    ///
    /// [`PacketError::TooShort`] when the frame has no full header,
    /// [`PacketError::Truncated`] when a known command's fields are cut off.
    pub fn decode(frame: &Bytes) -> Result<Self, PacketError> {
        if frame.len() < HEADER_SIZE {
            return Err(PacketError::TooShort {
                len: frame.len(),
                min: HEADER_SIZE,
            });
        }

        let sequence_number = frame[0];
        let code = frame[1];
        let payload = frame.slice(HEADER_SIZE..);

        let command = match Command::from_code(code) {
            Some(command) => command,
            None => {
                return Ok(Self::new(
                    sequence_number,
                    RequestBody::Unknown {
                        command: code,
                        payload,
                    },
                ))
            }
        };

        let expected = command.min_payload_len();
        if payload.len() < expected {
            return Err(PacketError::Truncated {
                command: code,
                expected: HEADER_SIZE + expected,
                actual: frame.len(),
            });
        }

        let unit = payload[0];
        let body = match command {
            Command::Status => RequestBody::Status {
                unit,
                status_code: payload[1],
            },
            Command::ReadBlock => RequestBody::ReadBlock {
                unit,
                block: read_u24(&payload[1..4]),
            },
            Command::WriteBlock => RequestBody::WriteBlock {
                unit,
                block: read_u24(&payload[1..4]),
                data: payload.slice(4..4 + BLOCK_SIZE),
            },
            Command::Format => RequestBody::Format { unit },
            Command::Control => RequestBody::Control {
                unit,
                control_code: payload[1],
                data: payload.slice(2..),
            },
            Command::Init => RequestBody::Init { unit },
            Command::Open => RequestBody::Open { unit },
            Command::Close => RequestBody::Close { unit },
            Command::Read => RequestBody::Read {
                unit,
                byte_count: u16::from_le_bytes([payload[1], payload[2]]),
                address: read_u24(&payload[3..6]),
            },
            Command::Write => {
                let byte_count = u16::from_le_bytes([payload[1], payload[2]]);
                let end = 6 + byte_count as usize;
                if payload.len() < end {
                    return Err(PacketError::Truncated {
                        command: code,
                        expected: HEADER_SIZE + end,
                        actual: frame.len(),
                    });
                }
                RequestBody::Write {
                    unit,
                    byte_count,
                    address: read_u24(&payload[3..6]),
                    data: payload.slice(6..end),
                }
            }
        };

        Ok(Self::new(sequence_number, body))
    }

    /// Encode to an unescaped frame.
    ///
    /// Used by hosts and tests; the engine only decodes requests.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 8);
        buf.put_u8(self.sequence_number);
        buf.put_u8(self.command_code());

        match &self.body {
            RequestBody::Status { unit, status_code } => {
                buf.put_slice(&[*unit, *status_code]);
            }
            RequestBody::ReadBlock { unit, block } => {
                buf.put_u8(*unit);
                buf.put_slice(&u24_bytes(*block));
            }
            RequestBody::WriteBlock { unit, block, data } => {
                buf.put_u8(*unit);
                buf.put_slice(&u24_bytes(*block));
                buf.put_slice(data);
            }
            RequestBody::Control {
                unit,
                control_code,
                data,
            } => {
                buf.put_slice(&[*unit, *control_code]);
                buf.put_slice(data);
            }
            RequestBody::Format { unit }
            | RequestBody::Init { unit }
            | RequestBody::Open { unit }
            | RequestBody::Close { unit } => buf.put_u8(*unit),
            RequestBody::Read {
                unit,
                byte_count,
                address,
            } => {
                buf.put_u8(*unit);
                buf.put_u16_le(*byte_count);
                buf.put_slice(&u24_bytes(*address));
            }
            RequestBody::Write {
                unit,
                byte_count,
                address,
                data,
            } => {
                buf.put_u8(*unit);
                buf.put_u16_le(*byte_count);
                buf.put_slice(&u24_bytes(*address));
                buf.put_slice(data);
            }
            RequestBody::Unknown { payload, .. } => buf.put_slice(payload),
        }

        buf.freeze()
    }

    /// Known command, or `None` for [`RequestBody::Unknown`].
    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.command_code())
    }

    /// Command byte as it appears on the wire.
    pub fn command_code(&self) -> u8 {
        match &self.body {
            RequestBody::Status { .. } => Command::Status.code(),
            RequestBody::ReadBlock { .. } => Command::ReadBlock.code(),
            RequestBody::WriteBlock { .. } => Command::WriteBlock.code(),
            RequestBody::Format { .. } => Command::Format.code(),
            RequestBody::Control { .. } => Command::Control.code(),
            RequestBody::Init { .. } => Command::Init.code(),
            RequestBody::Open { .. } => Command::Open.code(),
            RequestBody::Close { .. } => Command::Close.code(),
            RequestBody::Read { .. } => Command::Read.code(),
            RequestBody::Write { .. } => Command::Write.code(),
            RequestBody::Unknown { command, .. } => *command,
        }
    }

    /// Target unit, if the command addresses one.
    pub fn unit(&self) -> Option<u8> {
        match &self.body {
            RequestBody::Status { unit, .. }
            | RequestBody::ReadBlock { unit, .. }
            | RequestBody::WriteBlock { unit, .. }
            | RequestBody::Format { unit }
            | RequestBody::Control { unit, .. }
            | RequestBody::Init { unit }
            | RequestBody::Open { unit }
            | RequestBody::Close { unit }
            | RequestBody::Read { unit, .. }
            | RequestBody::Write { unit, .. } => Some(*unit),
            RequestBody::Unknown { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    #[test]
    fn test_decode_status() {
        let request = Request::decode(&frame(&[5, 0x00, 1, 0])).unwrap();
        assert_eq!(request.sequence_number, 5);
        assert_eq!(
            request.body,
            RequestBody::Status {
                unit: 1,
                status_code: 0
            }
        );
        assert_eq!(request.command(), Some(Command::Status));
    }

    #[test]
    fn test_decode_read_block_little_endian() {
        let request = Request::decode(&frame(&[9, 0x01, 2, 0x34, 0x12, 0x00])).unwrap();
        assert_eq!(
            request.body,
            RequestBody::ReadBlock {
                unit: 2,
                block: 0x1234
            }
        );
    }

    #[test]
    fn test_decode_write_block_carries_data() {
        let mut bytes = vec![1, 0x02, 1, 7, 0, 0];
        bytes.extend(std::iter::repeat(0xAA).take(BLOCK_SIZE));
        let request = Request::decode(&frame(&bytes)).unwrap();

        match request.body {
            RequestBody::WriteBlock { unit, block, data } => {
                assert_eq!(unit, 1);
                assert_eq!(block, 7);
                assert_eq!(data.len(), BLOCK_SIZE);
                assert!(data.iter().all(|&b| b == 0xAA));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_decode_write_block_short_data() {
        let err = Request::decode(&frame(&[1, 0x02, 1, 7, 0, 0, 0xAA])).unwrap_err();
        assert_eq!(
            err,
            PacketError::Truncated {
                command: 0x02,
                expected: HEADER_SIZE + 4 + BLOCK_SIZE,
                actual: 7
            }
        );
    }

    #[test]
    fn test_decode_write_respects_byte_count() {
        let bytes = [3, 0x09, 1, 3, 0, 0x00, 0x20, 0x00, b'a', b'b', b'c'];
        let request = Request::decode(&frame(&bytes)).unwrap();
        assert_eq!(
            request.body,
            RequestBody::Write {
                unit: 1,
                byte_count: 3,
                address: 0x2000,
                data: Bytes::from_static(b"abc"),
            }
        );

        let short = [3, 0x09, 1, 4, 0, 0x00, 0x20, 0x00, b'a'];
        assert!(matches!(
            Request::decode(&frame(&short)),
            Err(PacketError::Truncated { command: 0x09, .. })
        ));
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(
            Request::decode(&frame(&[5])),
            Err(PacketError::TooShort { len: 1, min: 2 })
        );
        assert_eq!(
            Request::decode(&Bytes::new()),
            Err(PacketError::TooShort { len: 0, min: 2 })
        );
    }

    #[test]
    fn test_decode_unknown_command() {
        let request = Request::decode(&frame(&[7, 0xFE, 1, 2])).unwrap();
        assert_eq!(request.sequence_number, 7);
        assert_eq!(request.command(), None);
        assert_eq!(request.command_code(), 0xFE);
        assert_eq!(request.unit(), None);
    }

    #[test]
    fn test_decode_status_missing_unit() {
        assert!(matches!(
            Request::decode(&frame(&[5, 0x00])),
            Err(PacketError::Truncated { command: 0x00, .. })
        ));
    }

    #[test]
    fn test_encode_matches_wire_layout() {
        let request = Request::new(
            4,
            RequestBody::Read {
                unit: 1,
                byte_count: 0x0102,
                address: 0x030405,
            },
        );
        assert_eq!(
            &request.encode()[..],
            &[4, 0x08, 1, 0x02, 0x01, 0x05, 0x04, 0x03]
        );
    }

    #[test]
    fn test_control_keeps_trailing_data() {
        let request = Request::new(
            2,
            RequestBody::Control {
                unit: 1,
                control_code: 0x05,
                data: Bytes::from_static(&[0xDE, 0xAD]),
            },
        );
        let decoded = Request::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
    }
}
