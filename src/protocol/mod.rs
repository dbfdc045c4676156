//! Protocol module - SLIP framing and SmartPort packets.
//!
//! This module implements the wire side of the bridge:
//! - SLIP escaping and the incremental frame decoder
//! - Command and status codes
//! - Request and response packets

mod command;
mod request;
mod response;
pub mod slip;

pub use command::{Command, StatusCode, BLOCK_SIZE, HEADER_SIZE};
pub use request::{Request, RequestBody};
pub use response::{Response, ResponseBody};
pub use slip::{DecodeOutcome, SlipDecoder, DEFAULT_MAX_FRAME_SIZE};

pub(crate) use command::u24_bytes;
