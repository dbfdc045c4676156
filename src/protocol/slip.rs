//! SLIP framing for the byte stream.
//!
//! Wire layout of one frame:
//! ```text
//! ┌──────────────────────────────┬──────┐
//! │ payload, END/ESC escaped     │ END  │
//! │ END  -> ESC ESC_END          │ 0xC0 │
//! │ ESC  -> ESC ESC_ESC          │      │
//! └──────────────────────────────┴──────┘
//! ```
//!
//! [`SlipDecoder`] is a state machine fed with arbitrary chunks from the
//! transport:
//! - `Idle`: nothing buffered
//! - `Accumulating`: collecting an unescaped frame
//! - `Resync`: a framing error was seen, bytes are dropped up to the next END
//!
//! Noise is only told apart from a frame by the END in front of it. A host
//! that starts each frame with an extra END gets line noise cut into its own
//! frame, which is dropped when it is an invalid escape or too short for a
//! packet. Noise that decodes as a packet is a packet. Noise with no END
//! after it joins the frame that follows.
//!
//! # Example
//!
//! ```
//! use smartport_bridge::protocol::{slip, DecodeOutcome, SlipDecoder};
//!
//! let wire = slip::encode(&[0x05, 0x00, 0xC0]);
//! let mut decoder = SlipDecoder::new();
//! let outcomes = decoder.push(&wire);
//!
//! assert_eq!(outcomes, vec![DecodeOutcome::Frame(vec![0x05, 0x00, 0xC0].into())]);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FramingError;

/// Frame terminator.
pub const END: u8 = 0xC0;
/// Escape introducer.
pub const ESC: u8 = 0xDB;
/// Substitute for a literal END after ESC.
pub const ESC_END: u8 = 0xDC;
/// Substitute for a literal ESC after ESC.
pub const ESC_ESC: u8 = 0xDD;

/// Default frame size limit (unescaped bytes).
///
/// The largest legal packet is a WriteBlock: 2 header bytes, unit,
/// 3 block bytes and 512 data bytes. The default leaves room for
/// Write/Control requests carrying larger buffers.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024;

/// Escape `payload` and terminate it with END.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(payload));
    encode_into(payload, &mut buf);
    buf.freeze()
}

/// Escape `payload` into an existing buffer and terminate it with END.
pub fn encode_into(payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(encoded_len(payload));
    for &byte in payload {
        match byte {
            END => buf.put_slice(&[ESC, ESC_END]),
            ESC => buf.put_slice(&[ESC, ESC_ESC]),
            other => buf.put_u8(other),
        }
    }
    buf.put_u8(END);
}

/// Exact encoded size of `payload`, terminator included.
pub fn encoded_len(payload: &[u8]) -> usize {
    payload.len() + payload.iter().filter(|&&b| b == END || b == ESC).count() + 1
}

/// Decode a buffer holding whole frames.
///
/// Stops at the first framing error; trailing bytes without a terminator
/// are ignored.
pub fn decode(bytes: &[u8]) -> Result<Vec<Bytes>, FramingError> {
    let mut decoder = SlipDecoder::with_max_frame_size(usize::MAX);
    decoder
        .push(bytes)
        .into_iter()
        .map(|outcome| match outcome {
            DecodeOutcome::Frame(frame) => Ok(frame),
            DecodeOutcome::Error(e) => Err(e),
        })
        .collect()
}

/// Result of feeding bytes to the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A complete, unescaped frame.
    Frame(Bytes),
    /// A frame was discarded; the decoder is resynchronizing.
    Error(FramingError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Accumulating { escaped: bool },
    Resync,
}

/// Incremental SLIP decoder.
///
/// Keeps partial frames across [`push`](SlipDecoder::push) calls and never
/// fails: errors are reported as [`DecodeOutcome::Error`] and the decoder
/// recovers at the next END.
#[derive(Debug)]
pub struct SlipDecoder {
    buffer: BytesMut,
    state: State,
    max_frame_size: usize,
}

impl SlipDecoder {
    /// Create a decoder with [`DEFAULT_MAX_FRAME_SIZE`].
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom frame size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_frame_size.min(4096)),
            state: State::Idle,
            max_frame_size,
        }
    }

    /// Feed a chunk and collect every frame or error it completes.
    pub fn push(&mut self, data: &[u8]) -> Vec<DecodeOutcome> {
        let mut outcomes = Vec::new();
        for &byte in data {
            if let Some(outcome) = self.push_byte(byte) {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    fn push_byte(&mut self, byte: u8) -> Option<DecodeOutcome> {
        match self.state {
            State::Idle => match byte {
                // Leading terminator or an idle line: nothing to emit.
                END => None,
                ESC => {
                    self.state = State::Accumulating { escaped: true };
                    None
                }
                other => {
                    self.state = State::Accumulating { escaped: false };
                    self.append(other)
                }
            },

            State::Accumulating { escaped: true } => match byte {
                ESC_END => {
                    self.state = State::Accumulating { escaped: false };
                    self.append(END)
                }
                ESC_ESC => {
                    self.state = State::Accumulating { escaped: false };
                    self.append(ESC)
                }
                END => {
                    // The END already closes the bad frame.
                    self.reset(State::Idle);
                    tracing::trace!("ESC followed by END, frame dropped");
                    Some(DecodeOutcome::Error(FramingError::InvalidEscape(END)))
                }
                other => {
                    self.reset(State::Resync);
                    tracing::trace!(byte = other, "invalid escape, resynchronizing");
                    Some(DecodeOutcome::Error(FramingError::InvalidEscape(other)))
                }
            },

            State::Accumulating { escaped: false } => match byte {
                END => {
                    self.state = State::Idle;
                    let frame = self.buffer.split().freeze();
                    Some(DecodeOutcome::Frame(frame))
                }
                ESC => {
                    self.state = State::Accumulating { escaped: true };
                    None
                }
                other => self.append(other),
            },

            State::Resync => {
                if byte == END {
                    tracing::trace!("resynchronized at END");
                    self.state = State::Idle;
                }
                None
            }
        }
    }

    fn append(&mut self, byte: u8) -> Option<DecodeOutcome> {
        if self.buffer.len() >= self.max_frame_size {
            let limit = self.max_frame_size;
            self.reset(State::Resync);
            tracing::trace!(limit, "oversized frame, resynchronizing");
            return Some(DecodeOutcome::Error(FramingError::Oversized { limit }));
        }
        self.buffer.put_u8(byte);
        None
    }

    fn reset(&mut self, state: State) {
        self.buffer.clear();
        self.state = state;
    }

    /// Number of unescaped bytes held for the current partial frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Check whether the decoder is dropping bytes until the next END.
    pub fn is_resyncing(&self) -> bool {
        self.state == State::Resync
    }

    /// Drop any partial frame and return to idle.
    pub fn clear(&mut self) {
        self.reset(State::Idle);
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::Idle => "Idle",
            State::Accumulating { .. } => "Accumulating",
            State::Resync => "Resync",
        }
    }
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(outcomes: Vec<DecodeOutcome>) -> Vec<Vec<u8>> {
        outcomes
            .into_iter()
            .filter_map(|o| match o {
                DecodeOutcome::Frame(f) => Some(f.to_vec()),
                DecodeOutcome::Error(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_encode_escapes_control_bytes() {
        let wire = encode(&[0x01, END, 0x02, ESC, 0x03]);
        assert_eq!(
            &wire[..],
            &[0x01, ESC, ESC_END, 0x02, ESC, ESC_ESC, 0x03, END]
        );
    }

    #[test]
    fn test_encoded_len_matches_encode() {
        let payload = [END, ESC, 0x00, END];
        assert_eq!(encoded_len(&payload), encode(&payload).len());
    }

    #[test]
    fn test_encode_empty_payload() {
        assert_eq!(&encode(&[])[..], &[END]);
    }

    #[test]
    fn test_round_trip_all_byte_values() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let decoded = decode(&encode(&payload)).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(&decoded[0][..], &payload[..]);
    }

    #[test]
    fn test_round_trip_only_control_bytes() {
        let payload = [END, END, ESC, ESC, END];
        let decoded = decode(&encode(&payload)).unwrap();
        assert_eq!(&decoded[0][..], &payload[..]);
    }

    #[test]
    fn test_leading_terminator_ignored() {
        let mut decoder = SlipDecoder::new();
        let mut wire = vec![END];
        wire.extend_from_slice(&encode(b"\x01\x00"));

        let outcomes = decoder.push(&wire);
        assert_eq!(frames(outcomes), vec![vec![0x01, 0x00]]);
    }

    #[test]
    fn test_back_to_back_terminators_yield_nothing() {
        let mut decoder = SlipDecoder::new();
        assert!(decoder.push(&[END, END, END]).is_empty());
        assert_eq!(decoder.state_name(), "Idle");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut decoder = SlipDecoder::new();
        let wire = encode(&[0x07, ESC, END, 0x42]);

        let mut all = Vec::new();
        for byte in wire.iter() {
            all.extend(decoder.push(&[*byte]));
        }
        assert_eq!(frames(all), vec![vec![0x07, ESC, END, 0x42]]);
    }

    #[test]
    fn test_escape_split_across_chunks() {
        let mut decoder = SlipDecoder::new();

        assert!(decoder.push(&[0x01, ESC]).is_empty());
        assert_eq!(decoder.state_name(), "Accumulating");

        let outcomes = decoder.push(&[ESC_END, END]);
        assert_eq!(frames(outcomes), vec![vec![0x01, END]]);
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut decoder = SlipDecoder::new();
        let mut wire = encode(b"\x01\x00").to_vec();
        wire.extend_from_slice(&encode(b"\x02\x01"));
        wire.extend_from_slice(&encode(b"\x03\x02"));

        let outcomes = decoder.push(&wire);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_invalid_escape_resyncs_to_next_end() {
        let mut decoder = SlipDecoder::new();

        let outcomes = decoder.push(&[0x01, ESC, 0x42, 0x05, 0x06]);
        assert_eq!(
            outcomes,
            vec![DecodeOutcome::Error(FramingError::InvalidEscape(0x42))]
        );
        assert!(decoder.is_resyncing());

        // Bytes up to the END are swallowed, the next frame survives.
        let mut wire = vec![0x99, END];
        wire.extend_from_slice(&encode(b"\x09\x00"));
        let outcomes = decoder.push(&wire);
        assert_eq!(frames(outcomes), vec![vec![0x09, 0x00]]);
    }

    #[test]
    fn test_escape_then_end_closes_bad_frame() {
        let mut decoder = SlipDecoder::new();
        let mut wire = vec![0x01, ESC, END];
        wire.extend_from_slice(&encode(b"\x02\x00"));

        let outcomes = decoder.push(&wire);
        assert_eq!(
            outcomes[0],
            DecodeOutcome::Error(FramingError::InvalidEscape(END))
        );
        assert_eq!(frames(outcomes), vec![vec![0x02, 0x00]]);
    }

    #[test]
    fn test_oversized_frame_is_dropped() {
        let mut decoder = SlipDecoder::with_max_frame_size(4);

        let outcomes = decoder.push(&[1, 2, 3, 4, 5, 6, END]);
        assert_eq!(
            outcomes,
            vec![DecodeOutcome::Error(FramingError::Oversized { limit: 4 })]
        );
        assert_eq!(decoder.state_name(), "Idle");

        let outcomes = decoder.push(&encode(&[1, 2, 3, 4]));
        assert_eq!(frames(outcomes), vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn test_decode_reports_first_error() {
        let result = decode(&[0x01, ESC, 0x00, END]);
        assert_eq!(result, Err(FramingError::InvalidEscape(0x00)));
    }

    #[test]
    fn test_clear_resets_state() {
        let mut decoder = SlipDecoder::new();
        decoder.push(&[0x01, 0x02]);
        assert_eq!(decoder.buffered(), 2);

        decoder.clear();
        assert_eq!(decoder.state_name(), "Idle");
        assert_eq!(decoder.buffered(), 0);
    }
}
