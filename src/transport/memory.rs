//! In-process transport over `tokio::io::duplex`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use super::{Transport, TransportKind};

/// One end of an in-memory pipe.
pub struct MemoryTransport {
    stream: DuplexStream,
    name: String,
}

impl MemoryTransport {
    /// Wrap one end of a duplex pipe.
    pub fn new(stream: DuplexStream, name: impl Into<String>) -> Self {
        Self {
            stream,
            name: name.into(),
        }
    }

    /// Create a connected pair: the bridge end and the host end.
    pub fn pair(max_buf_size: usize) -> (Self, DuplexStream) {
        let (bridge, host) = tokio::io::duplex(max_buf_size);
        (Self::new(bridge, "memory"), host)
    }
}

impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

impl AsyncRead for MemoryTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
