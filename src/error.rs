//! Error types for smartport-bridge.
//!
//! Errors fall into two groups:
//! - recoverable inside a session ([`FramingError`], [`PacketError`]), which the
//!   engine logs and skips past without answering;
//! - fatal to a session or to session creation ([`TransportError`],
//!   [`BridgeError::ResourceExhausted`]), which are handed to the caller.

use thiserror::Error;

use crate::transport::TransportKind;

/// Main error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// I/O error outside an established connection (config files, listeners).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON configuration could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Corrupt byte stream.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Well-framed packet that violates the packet layout.
    #[error("Malformed packet: {0}")]
    Packet(#[from] PacketError),

    /// The connection's medium failed or the connection is closed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A connector could not obtain a transport handle.
    #[error("Cannot establish {kind} transport: {source}")]
    ResourceExhausted {
        kind: TransportKind,
        #[source]
        source: std::io::Error,
    },

    /// No connector registered for the configured transport.
    #[error("No connector registered for transport {0}")]
    UnknownTransport(TransportKind),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors raised while splitting the byte stream into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    /// ESC followed by something other than ESC_END or ESC_ESC.
    #[error("invalid escape sequence: ESC followed by {0:#04x}")]
    InvalidEscape(u8),

    /// Frame grew past the configured limit before its terminator arrived.
    #[error("frame exceeds maximum size of {limit} bytes")]
    Oversized { limit: usize },
}

/// Errors raised while decoding a complete frame into a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Frame shorter than the sequence/command header.
    #[error("packet of {len} bytes is shorter than the {min}-byte header")]
    TooShort { len: usize, min: usize },

    /// Known command whose fixed fields are incomplete.
    #[error("command {command:#04x} needs {expected} bytes, got {actual}")]
    Truncated {
        command: u8,
        expected: usize,
        actual: usize,
    },
}

/// Errors raised by a connection's underlying medium.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection was closed, locally or by the peer.
    #[error("connection closed")]
    Closed,

    /// The medium rejected a read or write.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The medium accepted zero bytes of a write.
    #[error("write returned 0 bytes")]
    WriteZero,

    /// `create_read_channel` was already called on this connection.
    #[error("read channel already created")]
    ReadChannelTaken,
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
