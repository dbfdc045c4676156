//! Bridge builder and serve loop.
//!
//! The [`BridgeBuilder`] collects configuration, handlers and devices. The
//! [`Bridge`] then:
//! 1. Builds the configured connector
//! 2. Asks it for connections, one engine task per connection
//! 3. Waits and retries when no transport can be established
//! 4. Closes every live session on shutdown
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use smartport_bridge::config::BridgeConfig;
//! use smartport_bridge::device::{DeviceTable, MemoryDisk};
//! use smartport_bridge::Bridge;
//!
//! #[tokio::main]
//! async fn main() -> smartport_bridge::Result<()> {
//!     let bridge = Bridge::builder()
//!         .config(BridgeConfig::from_file("bridge.json")?)
//!         .devices(DeviceTable::new().with_device(Arc::new(MemoryDisk::new("DISK1", 1600))))
//!         .build()?;
//!
//!     bridge.run().await
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};

use crate::config::{BridgeConfig, EngineConfig};
use crate::connection::{CloseHandle, Connection, ConnectionId, ConnectionTable};
use crate::connector::{Connector, ConnectorRegistry};
use crate::device::DeviceTable;
use crate::engine::{Engine, SessionReport};
use crate::error::{BridgeError, Result};
use crate::handler::{BoxFuture, Handler, HandlerRegistry, HandlerResult};
use crate::protocol::{Command, Request};
use crate::transport::TransportKind;

/// Builder for configuring and creating a [`Bridge`].
pub struct BridgeBuilder {
    config: BridgeConfig,
    handlers: HandlerRegistry,
    connectors: ConnectorRegistry,
}

impl BridgeBuilder {
    /// Create a builder with default configuration and the TCP and serial
    /// connectors.
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
            handlers: HandlerRegistry::new(),
            connectors: ConnectorRegistry::with_defaults(),
        }
    }

    /// Replace the configuration.
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Select the transport.
    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.config.transport = kind;
        self
    }

    /// Set the per-session engine settings.
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.config.engine = engine;
        self
    }

    /// Set the pause before retrying a failed connection attempt.
    ///
    /// Default: 1 second
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Register an async closure for `command`.
    pub fn handle<F, Fut>(mut self, command: Command, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register(command, handler);
        self
    }

    /// Register a [`Handler`] implementation for `command`.
    pub fn handler<H: Handler>(mut self, command: Command, handler: H) -> Self {
        self.handlers.register_handler(command, handler);
        self
    }

    /// Serve the block commands from `devices`.
    ///
    /// Handlers registered afterwards for the same commands win.
    pub fn devices(mut self, devices: DeviceTable) -> Self {
        devices.install(&mut self.handlers);
        self
    }

    /// Add or replace the connector factory for `kind`.
    pub fn connector<F>(mut self, kind: TransportKind, factory: F) -> Self
    where
        F: Fn(&BridgeConfig, Arc<ConnectionTable>) -> BoxFuture<'static, Result<Box<dyn Connector>>>
            + Send
            + Sync
            + 'static,
    {
        self.connectors.register(kind, factory);
        self
    }

    /// Validate the configuration and build the bridge.
    pub fn build(self) -> Result<Bridge> {
        self.config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Bridge {
            config: self.config,
            handlers: Arc::new(self.handlers),
            connectors: self.connectors,
            table: Arc::new(ConnectionTable::new()),
            shutdown,
        })
    }
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured bridge.
///
/// Share it behind an `Arc` to call [`shutdown`](Bridge::shutdown) while
/// [`serve`](Bridge::serve) runs.
pub struct Bridge {
    config: BridgeConfig,
    handlers: Arc<HandlerRegistry>,
    connectors: ConnectorRegistry,
    table: Arc<ConnectionTable>,
    shutdown: watch::Sender<bool>,
}

impl Bridge {
    /// Create a new bridge builder.
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::new()
    }

    /// Validated configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Table of live connections.
    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.table
    }

    /// Handlers shared by every session.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Build the connector selected by the configuration.
    pub async fn connector(&self) -> Result<Box<dyn Connector>> {
        self.connectors.build(&self.config, self.table.clone()).await
    }

    /// Build the configured connector and serve it until shutdown.
    pub async fn run(&self) -> Result<()> {
        let connector = self.connector().await?;
        self.serve(connector.as_ref()).await
    }

    /// Stop [`serve`](Self::serve) and [`run_session`](Self::run_session),
    /// closing their sessions.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            tracing::info!("shutdown requested");
        }
    }

    /// Check whether shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Accept connections from `connector` until shutdown.
    ///
    /// Connectors that [accept many](Connector::accepts_many) sessions are
    /// asked for the next connection right away; others only once the
    /// current session has ended.
    ///
    /// # Errors
    ///
    /// Any connector error other than [`BridgeError::ResourceExhausted`],
    /// which is retried after the reconnect delay.
    pub async fn serve(&self, connector: &dyn Connector) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut sessions = JoinSet::new();
        let mut handles: HashMap<ConnectionId, CloseHandle> = HashMap::new();
        let accepts_many = connector.accepts_many();

        tracing::info!(transport = %connector.kind(), "serving");

        let result = loop {
            let ready = accepts_many || sessions.is_empty();
            tokio::select! {
                biased;
                _ = wait_shutdown(&mut shutdown) => break Ok(()),
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    reap(joined, &mut handles);
                }
                result = connector.create_connection(), if ready => match result {
                    Ok(connection) => {
                        let engine = Engine::new(connection, self.handlers.clone(), &self.config.engine);
                        let id = engine.id();
                        handles.insert(id, engine.close_handle());
                        sessions.spawn(async move { (id, engine.run().await) });
                    }
                    Err(e @ BridgeError::ResourceExhausted { .. }) => {
                        tracing::warn!(
                            delay_ms = self.config.reconnect_delay_ms,
                            "{}, retrying",
                            e
                        );
                        tokio::select! {
                            biased;
                            _ = wait_shutdown(&mut shutdown) => break Ok(()),
                            _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                        }
                    }
                    Err(e) => break Err(e),
                },
            }
        };

        for handle in handles.values() {
            handle.close().await;
        }
        while let Some(joined) = sessions.join_next().await {
            reap(joined, &mut handles);
        }

        tracing::info!("stopped serving");
        result
    }

    /// Run one session inline until it ends or the bridge shuts down.
    pub async fn run_session(&self, connection: Connection) -> Result<SessionReport> {
        let engine = Engine::new(connection, self.handlers.clone(), &self.config.engine);
        let handle = engine.close_handle();
        let mut shutdown = self.shutdown.subscribe();

        let session = engine.run();
        tokio::pin!(session);

        tokio::select! {
            biased;
            result = &mut session => return result,
            _ = wait_shutdown(&mut shutdown) => handle.close().await,
        }
        session.await
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // The sender is owned by the bridge, so an error means it is gone.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn reap(
    joined: std::result::Result<(ConnectionId, Result<SessionReport>), JoinError>,
    handles: &mut HashMap<ConnectionId, CloseHandle>,
) {
    match joined {
        Ok((id, Ok(report))) => {
            handles.remove(&id);
            tracing::info!(%id, end = ?report.end, "session finished");
        }
        Ok((id, Err(e))) => {
            handles.remove(&id);
            tracing::warn!(%id, "session failed: {}", e);
        }
        Err(e) => {
            // Handle left behind; it is closed on shutdown.
            tracing::error!("session task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SessionEnd;
    use crate::protocol::{slip, RequestBody, Response, StatusCode};
    use crate::transport::MemoryTransport;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_build_rejects_bad_config() {
        let mut config = BridgeConfig::default();
        config.engine.max_frame_size = 10;

        let result = Bridge::builder().config(config).build();
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_builder_setters_update_config() {
        let bridge = Bridge::builder()
            .transport(TransportKind::Serial)
            .reconnect_delay(Duration::from_millis(250))
            .engine(EngineConfig {
                replay_duplicates: false,
                ..EngineConfig::default()
            })
            .build()
            .unwrap();

        assert_eq!(bridge.config().transport, TransportKind::Serial);
        assert_eq!(bridge.config().reconnect_delay_ms, 250);
        assert!(!bridge.config().engine.replay_duplicates);
    }

    #[tokio::test]
    async fn test_run_session_answers_and_ends() {
        let bridge = Bridge::builder()
            .handle(Command::Init, |_| async { Ok(Bytes::new()) })
            .build()
            .unwrap();

        let (transport, mut host) = MemoryTransport::pair(1024);
        let connection = Connection::new(transport, bridge.table().clone());

        // The host hangs up after one exchange, which ends the session.
        let host_task = tokio::spawn(async move {
            let request = Request::new(9, RequestBody::Init { unit: 0 });
            host.write_all(&slip::encode(&request.encode())).await.unwrap();

            let mut wire = [0u8; 3];
            host.read_exact(&mut wire).await.unwrap();
            wire
        });

        let report = bridge.run_session(connection).await.unwrap();
        assert_eq!(report.end, SessionEnd::PeerClosed);
        assert_eq!(report.stats.responses, 1);
        assert!(bridge.table().is_empty());

        let wire = host_task.await.unwrap();
        let frames = slip::decode(&wire).unwrap();
        let response = Response::decode(&frames[0]).unwrap();
        assert_eq!(response.sequence_number(), 9);
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_run_session() {
        let bridge = Arc::new(Bridge::builder().build().unwrap());
        let (transport, _host) = MemoryTransport::pair(64);
        let connection = Connection::new(transport, bridge.table().clone());

        let runner = bridge.clone();
        let session = tokio::spawn(async move { runner.run_session(connection).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        bridge.shutdown();

        let report = session.await.unwrap().unwrap();
        assert_eq!(report.end, SessionEnd::Cancelled);
        assert!(bridge.is_shutdown());
    }
}
