//! Protocol engine - one session over one connection.
//!
//! The engine cycles through
//!
//! ```text
//! AwaitFrame ─► Decode ─► Dispatch ─► Encode ─► Write ─┐
//!     ▲                                                 │
//!     └─────────────────────────────────────────────────┘
//! ```
//!
//! with at most one request outstanding. Frames completed by a chunk that
//! also completed earlier frames wait in a queue; nothing is decoded while a
//! response is being written.
//!
//! Framing noise and malformed packets are counted and skipped without a
//! response. A transport failure closes the connection and ends the session
//! with an error.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tracing::Instrument;

use crate::config::EngineConfig;
use crate::connection::{CloseHandle, Connection, ConnectionId, ReadEvent};
use crate::error::{BridgeError, Result, TransportError};
use crate::handler::HandlerRegistry;
use crate::protocol::{slip, DecodeOutcome, Request, Response, SlipDecoder};

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Complete frames taken from the stream.
    pub frames: u64,
    /// Responses written, replays included.
    pub responses: u64,
    /// Frames discarded by the SLIP decoder.
    pub framing_errors: u64,
    /// Frames that did not decode into a request.
    pub malformed_packets: u64,
    /// Duplicate requests answered from the cache.
    pub replays: u64,
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The host closed its side of the transport.
    PeerClosed,
    /// The connection was closed locally.
    Cancelled,
}

/// Outcome of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub id: ConnectionId,
    pub end: SessionEnd,
    pub stats: SessionStats,
}

/// Last request frame and the encoded response it got.
struct Replay {
    request: Bytes,
    response: Bytes,
}

/// Drives one connection.
pub struct Engine {
    connection: Connection,
    handlers: Arc<HandlerRegistry>,
    decoder: SlipDecoder,
    pending: VecDeque<Bytes>,
    replay_duplicates: bool,
    last: Option<Replay>,
    stats: SessionStats,
}

impl Engine {
    /// Take ownership of `connection` and apply the engine settings to it.
    pub fn new(
        connection: Connection,
        handlers: Arc<HandlerRegistry>,
        config: &EngineConfig,
    ) -> Self {
        let connection =
            connection.with_read_options(config.read_buffer_size, config.channel_capacity);
        Self {
            connection,
            handlers,
            decoder: SlipDecoder::with_max_frame_size(config.max_frame_size),
            pending: VecDeque::new(),
            replay_duplicates: config.replay_duplicates,
            last: None,
            stats: SessionStats::default(),
        }
    }

    /// Connection this engine drives.
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Handle for cancelling the session from another task.
    pub fn close_handle(&self) -> CloseHandle {
        self.connection.close_handle()
    }

    /// Counters so far.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Run until the peer closes, the connection is closed locally, or the
    /// transport fails.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Transport`] on a read or write failure. The
    /// connection is closed before this returns.
    pub async fn run(self) -> Result<SessionReport> {
        let span = tracing::info_span!(
            "session",
            id = %self.connection.id(),
            transport = %self.connection.kind(),
            peer = %self.connection.peer()
        );
        self.run_loop().instrument(span).await
    }

    async fn run_loop(mut self) -> Result<SessionReport> {
        let mut channel = match self.connection.create_read_channel() {
            Ok(channel) => channel,
            Err(TransportError::Closed) => return Ok(self.finish(SessionEnd::Cancelled)),
            Err(e) => return Err(self.fail(e).await),
        };
        tracing::info!("session started");

        loop {
            // AwaitFrame
            let frame = match self.pending.pop_front() {
                Some(frame) => frame,
                None => match channel.recv().await {
                    Some(ReadEvent::Data(chunk)) => {
                        self.ingest(&chunk);
                        continue;
                    }
                    Some(ReadEvent::Eof) => {
                        if self.decoder.buffered() > 0 {
                            tracing::debug!(
                                bytes = self.decoder.buffered(),
                                "partial frame dropped at end of stream"
                            );
                        }
                        self.connection.close_connection().await;
                        return Ok(self.finish(SessionEnd::PeerClosed));
                    }
                    Some(ReadEvent::Failed(e)) => {
                        return Err(self.fail(TransportError::Io(e)).await);
                    }
                    None => return Ok(self.finish(SessionEnd::Cancelled)),
                },
            };
            self.stats.frames += 1;

            if let Some(response) = self.cached_response(&frame) {
                tracing::debug!(seq = frame[0], "duplicate request, replaying response");
                self.stats.replays += 1;
                if !self.write(&response).await? {
                    return Ok(self.finish(SessionEnd::Cancelled));
                }
                continue;
            }

            // Decode
            let request = match Request::decode(&frame) {
                Ok(request) => request,
                Err(e) => {
                    self.stats.malformed_packets += 1;
                    tracing::debug!(len = frame.len(), "malformed packet dropped: {}", e);
                    continue;
                }
            };
            tracing::trace!(
                seq = request.sequence_number,
                command = request.command_code(),
                "request"
            );

            // Dispatch
            let dispatched = tokio::select! {
                biased;
                _ = self.connection.closed() => None,
                response = self.handlers.dispatch(request) => Some(response),
            };
            let Some(response) = dispatched.filter(|_| self.connection.is_open()) else {
                tracing::debug!("connection closed during dispatch, response discarded");
                return Ok(self.finish(SessionEnd::Cancelled));
            };

            // Encode
            let encoded = encode_response(&response);

            // Write
            if !self.write(&encoded).await? {
                return Ok(self.finish(SessionEnd::Cancelled));
            }
            if self.replay_duplicates {
                self.last = Some(Replay {
                    request: frame,
                    response: encoded,
                });
            }
        }
    }

    /// Run a chunk through the decoder and queue completed frames.
    fn ingest(&mut self, chunk: &[u8]) {
        for outcome in self.decoder.push(chunk) {
            match outcome {
                DecodeOutcome::Frame(frame) => self.pending.push_back(frame),
                DecodeOutcome::Error(e) => {
                    self.stats.framing_errors += 1;
                    tracing::debug!("framing error: {}", e);
                }
            }
        }
    }

    fn cached_response(&self, frame: &Bytes) -> Option<Bytes> {
        self.last
            .as_ref()
            .filter(|last| last.request == *frame)
            .map(|last| last.response.clone())
    }

    /// Send one encoded response. `Ok(false)` if the connection was closed
    /// locally before it went out.
    async fn write(&mut self, encoded: &[u8]) -> Result<bool> {
        match self.connection.send_data(encoded).await {
            Ok(()) => {
                self.stats.responses += 1;
                Ok(true)
            }
            Err(TransportError::Closed) => {
                tracing::debug!("connection closed before the response was written");
                Ok(false)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Close after a transport failure and hand back the error.
    async fn fail(&mut self, error: TransportError) -> BridgeError {
        tracing::warn!(stats = ?self.stats, "transport failed: {}", error);
        self.connection.close_connection().await;
        BridgeError::Transport(error)
    }

    fn finish(&self, end: SessionEnd) -> SessionReport {
        tracing::info!(?end, stats = ?self.stats, "session ended");
        SessionReport {
            id: self.connection.id(),
            end,
            stats: self.stats,
        }
    }
}

/// Serialize and SLIP-frame a response.
pub fn encode_response(response: &Response) -> Bytes {
    slip::encode(&response.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionTable;
    use crate::protocol::{Command, RequestBody, StatusCode};
    use crate::transport::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn status_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(Command::Status, |_| async {
            Ok(Bytes::from_static(&[0xF8, 0x00, 0x01, 0x00]))
        });
        registry
    }

    type Session = tokio::task::JoinHandle<Result<SessionReport>>;

    fn start(registry: HandlerRegistry, config: EngineConfig) -> (DuplexStream, Session, CloseHandle) {
        start_with_pipe(registry, config, 4096)
    }

    fn start_with_pipe(
        registry: HandlerRegistry,
        config: EngineConfig,
        pipe_size: usize,
    ) -> (DuplexStream, Session, CloseHandle) {
        let table = Arc::new(ConnectionTable::new());
        let (transport, host) = MemoryTransport::pair(pipe_size);
        let engine = Engine::new(Connection::new(transport, table), Arc::new(registry), &config);
        let handle = engine.close_handle();
        (host, tokio::spawn(engine.run()), handle)
    }

    fn status_frame(seq: u8) -> Bytes {
        let request = Request::new(
            seq,
            RequestBody::Status {
                unit: 1,
                status_code: 0,
            },
        );
        slip::encode(&request.encode())
    }

    /// Read one SLIP frame from the host side.
    async fn read_frame(host: &mut DuplexStream) -> Response {
        let mut wire = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            host.read_exact(&mut byte).await.unwrap();
            wire.push(byte[0]);
            if byte[0] == slip::END {
                break;
            }
        }
        let frames = slip::decode(&wire).unwrap();
        Response::decode(&frames[0]).unwrap()
    }

    #[tokio::test]
    async fn test_status_request_answered() {
        let (mut host, session, _handle) = start(status_registry(), EngineConfig::default());

        host.write_all(&status_frame(5)).await.unwrap();
        let response = read_frame(&mut host).await;

        assert_eq!(response.sequence_number(), 5);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.payload(), &[0xF8, 0x00, 0x01, 0x00]);

        drop(host);
        let report = session.await.unwrap().unwrap();
        assert_eq!(report.end, SessionEnd::PeerClosed);
        assert_eq!(report.stats.frames, 1);
        assert_eq!(report.stats.responses, 1);
    }

    #[tokio::test]
    async fn test_frames_in_one_chunk_answered_in_order() {
        let (mut host, _session, _handle) = start(status_registry(), EngineConfig::default());

        let mut wire = Vec::new();
        for seq in [1u8, 2, 3] {
            wire.extend_from_slice(&status_frame(seq));
        }
        host.write_all(&wire).await.unwrap();

        for seq in [1u8, 2, 3] {
            assert_eq!(read_frame(&mut host).await.sequence_number(), seq);
        }
    }

    #[tokio::test]
    async fn test_malformed_then_valid() {
        let (mut host, session, _handle) = start(status_registry(), EngineConfig::default());

        host.write_all(&slip::encode(&[0x09])).await.unwrap();
        host.write_all(&status_frame(6)).await.unwrap();

        assert_eq!(read_frame(&mut host).await.sequence_number(), 6);

        drop(host);
        let report = session.await.unwrap().unwrap();
        assert_eq!(report.stats.malformed_packets, 1);
        assert_eq!(report.stats.responses, 1);
    }

    #[tokio::test]
    async fn test_noise_before_frame() {
        let (mut host, session, _handle) = start(status_registry(), EngineConfig::default());

        host.write_all(&[0x13, slip::ESC, 0x00, 0x77, 0x42]).await.unwrap();
        host.write_all(&[slip::END]).await.unwrap();
        host.write_all(&status_frame(8)).await.unwrap();

        assert_eq!(read_frame(&mut host).await.sequence_number(), 8);

        drop(host);
        let report = session.await.unwrap().unwrap();
        assert_eq!(report.stats.framing_errors, 1);
        assert_eq!(report.stats.responses, 1);
    }

    #[tokio::test]
    async fn test_duplicate_replayed_without_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = calls.clone();
        registry.register(Command::Status, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Bytes::from_static(&[0xF8, 0, 0, 0])) }
        });

        let (mut host, session, _handle) = start(registry, EngineConfig::default());

        host.write_all(&status_frame(4)).await.unwrap();
        let first = read_frame(&mut host).await;
        host.write_all(&status_frame(4)).await.unwrap();
        let second = read_frame(&mut host).await;

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(host);
        let report = session.await.unwrap().unwrap();
        assert_eq!(report.stats.replays, 1);
        assert_eq!(report.stats.responses, 2);
    }

    #[tokio::test]
    async fn test_duplicate_dispatched_when_replay_disabled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = calls.clone();
        registry.register(Command::Status, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Bytes::new()) }
        });

        let config = EngineConfig {
            replay_duplicates: false,
            ..EngineConfig::default()
        };
        let (mut host, _session, _handle) = start(registry, config);

        for _ in 0..2 {
            host.write_all(&status_frame(4)).await.unwrap();
            read_frame(&mut host).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_cancels_session() {
        let (_host, session, handle) = start(status_registry(), EngineConfig::default());

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.close().await;

        let report = session.await.unwrap().unwrap();
        assert_eq!(report.end, SessionEnd::Cancelled);
        assert_eq!(report.stats, SessionStats::default());
    }

    #[tokio::test]
    async fn test_close_during_dispatch_discards_response() {
        let mut registry = HandlerRegistry::new();
        registry.register(Command::Status, |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Bytes::new())
        });
        let (mut host, session, handle) = start(registry, EngineConfig::default());

        host.write_all(&status_frame(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.close().await;

        let report = tokio::time::timeout(Duration::from_secs(1), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.end, SessionEnd::Cancelled);
        assert_eq!(report.stats.responses, 0);

        // Shut down without a response: the host sees end of stream.
        let mut rest = Vec::new();
        host.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_close_during_blocked_write_cancels() {
        let mut registry = HandlerRegistry::new();
        registry.register(Command::Status, |_| async { Ok(Bytes::from(vec![0x5A; 512])) });
        let (mut host, session, handle) = start_with_pipe(registry, EngineConfig::default(), 16);

        // The answer does not fit the pipe and the host never reads it.
        host.write_all(&status_frame(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_finished());

        tokio::time::timeout(Duration::from_secs(1), handle.close())
            .await
            .unwrap();
        let report = tokio::time::timeout(Duration::from_secs(1), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(report.end, SessionEnd::Cancelled);
        assert_eq!(report.stats.frames, 1);
        assert_eq!(report.stats.responses, 0);
    }

    #[tokio::test]
    async fn test_write_failure_ends_session() {
        let (mut host, session, _handle) = start(status_registry(), EngineConfig::default());

        // The host sends a request and vanishes before the answer.
        host.write_all(&status_frame(2)).await.unwrap();
        drop(host);

        // The answer is written into a pipe whose reader is gone.
        let result = session.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Transport(_))));
    }
}
