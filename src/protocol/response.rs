//! Response packets.
//!
//! A response echoes the request's sequence number and carries a status
//! byte. The constructors keep the body consistent with the status:
//! successful responses carry result data (or nothing), failed responses
//! carry nothing or diagnostic detail only.

use bytes::{BufMut, Bytes, BytesMut};

use super::command::{StatusCode, HEADER_SIZE};
use super::Request;
use crate::error::PacketError;

/// Payload shape of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// No payload.
    Empty,
    /// Result data of a successful command.
    Data(Bytes),
    /// Detail attached to a failure status.
    Diagnostic(Bytes),
}

impl ResponseBody {
    /// Payload bytes, empty for [`ResponseBody::Empty`].
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ResponseBody::Empty => &[],
            ResponseBody::Data(b) | ResponseBody::Diagnostic(b) => b,
        }
    }
}

/// A response to exactly one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    sequence_number: u8,
    status: StatusCode,
    body: ResponseBody,
}

impl Response {
    /// Successful response with result data.
    pub fn ok(sequence_number: u8, data: Bytes) -> Self {
        let body = if data.is_empty() {
            ResponseBody::Empty
        } else {
            ResponseBody::Data(data)
        };
        Self {
            sequence_number,
            status: StatusCode::OK,
            body,
        }
    }

    /// Successful response without payload.
    pub fn empty(sequence_number: u8) -> Self {
        Self {
            sequence_number,
            status: StatusCode::OK,
            body: ResponseBody::Empty,
        }
    }

    /// Failed response without payload.
    ///
    /// An `OK` status here yields an empty success response.
    pub fn error(sequence_number: u8, status: StatusCode) -> Self {
        Self {
            sequence_number,
            status,
            body: ResponseBody::Empty,
        }
    }

    /// Failed response with diagnostic detail.
    ///
    /// The detail is dropped if `status` is `OK`.
    pub fn diagnostic(sequence_number: u8, status: StatusCode, detail: Bytes) -> Self {
        let body = if status.is_ok() || detail.is_empty() {
            ResponseBody::Empty
        } else {
            ResponseBody::Diagnostic(detail)
        };
        Self {
            sequence_number,
            status,
            body,
        }
    }

    /// Answer to a command the target does not implement.
    pub fn unsupported(request: &Request) -> Self {
        Self::error(request.sequence_number, StatusCode::BAD_COMMAND)
    }

    /// Sequence number of the request this answers.
    #[inline]
    pub fn sequence_number(&self) -> u8 {
        self.sequence_number
    }

    /// Status byte.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Payload.
    #[inline]
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.body.as_bytes()
    }

    /// Encoded size (unescaped).
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload().len()
    }

    /// Encode to an unescaped frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into an existing buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.sequence_number);
        buf.put_u8(self.status.code());
        buf.put_slice(self.payload());
    }

    /// Decode a response frame, as a host would.
    pub fn decode(frame: &Bytes) -> Result<Self, PacketError> {
        if frame.len() < HEADER_SIZE {
            return Err(PacketError::TooShort {
                len: frame.len(),
                min: HEADER_SIZE,
            });
        }
        let sequence_number = frame[0];
        let status = StatusCode(frame[1]);
        let payload = frame.slice(HEADER_SIZE..);

        Ok(if status.is_ok() {
            Self::ok(sequence_number, payload)
        } else {
            Self::diagnostic(sequence_number, status, payload)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestBody;

    #[test]
    fn test_ok_response_layout() {
        let response = Response::ok(5, Bytes::from_static(&[0xF8, 0x00, 0x01, 0x00]));
        assert_eq!(&response.encode()[..], &[5, 0x00, 0xF8, 0x00, 0x01, 0x00]);
        assert!(response.status().is_ok());
    }

    #[test]
    fn test_ok_with_empty_data_is_empty_body() {
        let response = Response::ok(1, Bytes::new());
        assert_eq!(response.body(), &ResponseBody::Empty);
    }

    #[test]
    fn test_error_has_no_payload() {
        let response = Response::error(9, StatusCode::OFFLINE);
        assert_eq!(&response.encode()[..], &[9, 0x2F]);
        assert!(response.payload().is_empty());
    }

    #[test]
    fn test_diagnostic_dropped_on_success() {
        let response = Response::diagnostic(3, StatusCode::OK, Bytes::from_static(b"x"));
        assert_eq!(response.body(), &ResponseBody::Empty);

        let response = Response::diagnostic(3, StatusCode::IO_ERROR, Bytes::from_static(b"x"));
        assert_eq!(
            response.body(),
            &ResponseBody::Diagnostic(Bytes::from_static(b"x"))
        );
    }

    #[test]
    fn test_unsupported_pairs_sequence() {
        let request = Request::new(
            7,
            RequestBody::Unknown {
                command: 0xFE,
                payload: Bytes::new(),
            },
        );
        let response = Response::unsupported(&request);
        assert_eq!(response.sequence_number(), 7);
        assert_eq!(response.status(), StatusCode::BAD_COMMAND);
        assert!(response.payload().is_empty());
    }

    #[test]
    fn test_decode_response() {
        let response = Response::decode(&Bytes::from_static(&[2, 0x27, 0xEE])).unwrap();
        assert_eq!(response.sequence_number(), 2);
        assert_eq!(response.status(), StatusCode::IO_ERROR);
        assert_eq!(response.payload(), &[0xEE]);

        assert!(Response::decode(&Bytes::from_static(&[2])).is_err());
    }
}
