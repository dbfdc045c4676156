//! Connection module - one transport under session control.
//!
//! A [`Connection`] owns both halves of a [`Transport`]:
//! - the write half sits behind an async mutex, so writes never interleave;
//! - the read half moves into a reader task on
//!   [`create_read_channel`](Connection::create_read_channel), which forwards
//!   chunks to a [`ReadChannel`].
//!
//! ```text
//! Transport ─► reader task ─► mpsc<Inbound{id, event}> ─► ReadChannel::recv ─► engine
//!                    ▲                                         │
//!                    └──────────── watch<closed> ──────────────┘
//! ```
//!
//! Every inbound event carries the connection's [`ConnectionId`]. The
//! channel checks it against the [`ConnectionTable`] before delivery, and
//! returns `None` once the connection is closed, even for chunks already
//! queued.

mod table;

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

use crate::config::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_READ_BUFFER_SIZE};
use crate::error::TransportError;
use crate::transport::{Transport, TransportKind};

pub use table::{ConnectionId, ConnectionInfo, ConnectionTable};

type BoxedTransport = Box<dyn Transport>;

/// Upper bound on shutting down the write half after close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Something that happened on the inbound side of a transport.
#[derive(Debug)]
pub enum ReadEvent {
    /// Bytes in arrival order, with no frame boundaries implied.
    Data(Bytes),
    /// The peer closed its side.
    Eof,
    /// The medium failed; no further events follow.
    Failed(io::Error),
}

#[derive(Debug)]
struct Inbound {
    id: ConnectionId,
    event: ReadEvent,
}

/// State shared between a connection and its close handles.
struct Shared {
    id: ConnectionId,
    table: Arc<ConnectionTable>,
    closed: watch::Sender<bool>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedTransport>>>,
    reader: Mutex<Option<ReadHalf<BoxedTransport>>>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        // The sender lives in `self`, so this only ends on close.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Flip to closed and free the slot. Returns `true` the first time.
    fn mark_closed(&self) -> bool {
        let was_closed = self.closed.send_replace(true);
        if !was_closed {
            self.table.release(self.id);
        }
        !was_closed
    }

    fn take_reader(&self) -> Option<ReadHalf<BoxedTransport>> {
        self.reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn close(&self) {
        let first = self.mark_closed();
        drop(self.take_reader());

        // A blocked `send` sees the flag and gives the lock up.
        let mut writer = self.writer.lock().await;
        if let Some(mut half) = writer.take() {
            let shutdown = tokio::time::timeout(SHUTDOWN_TIMEOUT, half.shutdown()).await;
            match shutdown {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(id = %self.id, "shutdown after close failed: {}", e),
                Err(_) => tracing::debug!(id = %self.id, "shutdown after close timed out"),
            }
        }

        if first {
            tracing::debug!(id = %self.id, "connection closed");
        }
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut writer = tokio::select! {
            biased;
            _ = self.wait_closed() => return Err(TransportError::Closed),
            writer = self.writer.lock() => writer,
        };
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let half = writer.as_mut().ok_or(TransportError::Closed)?;

        let written = tokio::select! {
            biased;
            _ = self.wait_closed() => None,
            result = write_frame(half, data) => Some(result),
        };
        match written {
            Some(result) => result,
            None => {
                // The frame is cut short; the half is not reused.
                drop(writer.take());
                Err(TransportError::Closed)
            }
        }
    }
}

async fn write_frame(
    half: &mut WriteHalf<BoxedTransport>,
    data: &[u8],
) -> Result<(), TransportError> {
    half.write_all(data).await.map_err(|e| match e.kind() {
        io::ErrorKind::WriteZero => TransportError::WriteZero,
        _ => TransportError::Io(e),
    })?;
    half.flush().await?;
    Ok(())
}

/// A transport registered in the connection table.
///
/// Owned by the engine of its session. Dropping it closes it without
/// waiting for the write half to shut down.
pub struct Connection {
    id: ConnectionId,
    kind: TransportKind,
    peer: String,
    shared: Arc<Shared>,
    read_buffer_size: usize,
    channel_capacity: usize,
}

impl Connection {
    /// Register `transport` in `table` and take ownership of it.
    pub fn new<T: Transport>(transport: T, table: Arc<ConnectionTable>) -> Self {
        let kind = transport.kind();
        let peer = transport.peer();
        let id = table.register(kind, peer.clone());

        let boxed: BoxedTransport = Box::new(transport);
        let (reader, writer) = tokio::io::split(boxed);
        let (closed, _) = watch::channel(false);

        tracing::debug!(%id, %kind, %peer, "connection registered");

        Self {
            id,
            kind,
            peer,
            shared: Arc::new(Shared {
                id,
                table,
                closed,
                writer: tokio::sync::Mutex::new(Some(writer)),
                reader: Mutex::new(Some(reader)),
            }),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Set the reader task's read size and queue depth.
    ///
    /// Takes effect for a read channel created afterwards.
    pub fn with_read_options(mut self, read_buffer_size: usize, channel_capacity: usize) -> Self {
        self.read_buffer_size = read_buffer_size.max(1);
        self.channel_capacity = channel_capacity.max(1);
        self
    }

    /// Slot handle of this connection.
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Transport medium.
    #[inline]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Peer description.
    #[inline]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Check whether the connection is still open.
    pub fn is_open(&self) -> bool {
        !self.shared.is_closed()
    }

    /// Resolve once the connection is closed.
    pub async fn closed(&self) {
        self.shared.wait_closed().await;
    }

    /// Handle that can close this connection from another task.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            shared: self.shared.clone(),
        }
    }

    /// Write all of `data` and flush.
    ///
    /// Concurrent calls are serialized; a write is never interleaved with
    /// another. A write still blocked when the connection is closed is
    /// abandoned.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] if closed before or during the write,
    /// otherwise the medium's error.
    pub async fn send_data(&self, data: &[u8]) -> Result<(), TransportError> {
        self.shared.send(data).await
    }

    /// Start the reader task and return the channel it feeds.
    ///
    /// Returns immediately; reading happens on a spawned task.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] after close,
    /// [`TransportError::ReadChannelTaken`] on a second call.
    pub fn create_read_channel(&self) -> Result<ReadChannel, TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        let reader = self
            .shared
            .take_reader()
            .ok_or(TransportError::ReadChannelTaken)?;

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        tokio::spawn(read_loop(
            self.id,
            reader,
            tx,
            self.shared.closed.subscribe(),
            self.read_buffer_size,
        ));

        Ok(ReadChannel {
            id: self.id,
            rx,
            closed: self.shared.closed.subscribe(),
            table: self.shared.table.clone(),
        })
    }

    /// Close the connection. Safe to call more than once.
    ///
    /// Pending [`ReadChannel::recv`] calls return `None`, queued chunks are
    /// discarded, the slot is freed and the transport is shut down.
    pub async fn close_connection(&self) {
        self.shared.close().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.mark_closed();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Cloneable handle for closing a connection from outside its session.
#[derive(Clone)]
pub struct CloseHandle {
    shared: Arc<Shared>,
}

impl CloseHandle {
    /// Connection this handle closes.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Check whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolve once the connection is closed.
    pub async fn closed(&self) {
        self.shared.wait_closed().await;
    }

    /// Same as [`Connection::close_connection`].
    pub async fn close(&self) {
        self.shared.close().await;
    }
}

/// Inbound side of a connection.
pub struct ReadChannel {
    id: ConnectionId,
    rx: mpsc::Receiver<Inbound>,
    closed: watch::Receiver<bool>,
    table: Arc<ConnectionTable>,
}

impl ReadChannel {
    /// Connection this channel reads from.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Wait for the next inbound event.
    ///
    /// Returns `None` once the connection is closed or the reader task has
    /// finished.
    pub async fn recv(&mut self) -> Option<ReadEvent> {
        loop {
            if *self.closed.borrow() {
                return None;
            }

            let inbound = tokio::select! {
                biased;
                _ = self.closed.wait_for(|closed| *closed) => return None,
                inbound = self.rx.recv() => inbound?,
            };

            if *self.closed.borrow() {
                return None;
            }
            if inbound.id != self.id || !self.table.is_live(inbound.id) {
                tracing::debug!(id = %inbound.id, "dropping event for stale connection");
                continue;
            }
            return Some(inbound.event);
        }
    }
}

async fn read_loop(
    id: ConnectionId,
    mut reader: ReadHalf<BoxedTransport>,
    tx: mpsc::Sender<Inbound>,
    mut closed: watch::Receiver<bool>,
    read_buffer_size: usize,
) {
    let mut buf = BytesMut::with_capacity(read_buffer_size);

    loop {
        buf.reserve(read_buffer_size);
        let event = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => break,
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => ReadEvent::Eof,
                Ok(_) => ReadEvent::Data(buf.split().freeze()),
                Err(e) => ReadEvent::Failed(e),
            },
        };

        let last = !matches!(event, ReadEvent::Data(_));
        if tx.send(Inbound { id, event }).await.is_err() || last {
            break;
        }
    }

    tracing::trace!(%id, "reader task finished");
}
