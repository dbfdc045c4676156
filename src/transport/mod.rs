//! Transport module - byte streams a connection can run over.
//!
//! Provides:
//! - TCP sockets ([`TcpTransport`])
//! - Serial lines opened as device files ([`SerialTransport`], Unix only)
//! - In-process duplex pipes ([`MemoryTransport`])
//!
//! Every transport wraps an already-established handle; accepting, dialing
//! and opening belong to the connectors.

mod memory;
#[cfg(unix)]
mod serial;
mod tcp;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

pub use memory::MemoryTransport;
#[cfg(unix)]
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// Transport media a deployment can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Serial,
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Serial => "serial",
            TransportKind::Memory => "memory",
        })
    }
}

/// A connected byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Medium this transport runs over.
    fn kind(&self) -> TransportKind;

    /// Human-readable peer description for logs.
    fn peer(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serde_names() {
        let kind: TransportKind = serde_json::from_str("\"serial\"").unwrap();
        assert_eq!(kind, TransportKind::Serial);
        assert_eq!(serde_json::to_string(&TransportKind::Tcp).unwrap(), "\"tcp\"");
        assert!(serde_json::from_str::<TransportKind>("\"usb\"").is_err());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(TransportKind::Memory.to_string(), "memory");
        assert_eq!(TransportKind::default(), TransportKind::Tcp);
    }
}
