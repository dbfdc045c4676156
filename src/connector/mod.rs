//! Connector module - factories producing connections.
//!
//! A [`Connector`] turns a transport medium into ready [`Connection`]s, one
//! per call. Which connector a deployment runs is decided at startup by
//! [`ConnectorRegistry::build`] from the configured [`TransportKind`]; the
//! connectors themselves never branch on the medium.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use smartport_bridge::config::BridgeConfig;
//! use smartport_bridge::connection::ConnectionTable;
//! use smartport_bridge::connector::ConnectorRegistry;
//!
//! let config = BridgeConfig::default();
//! let table = Arc::new(ConnectionTable::new());
//! let connector = ConnectorRegistry::with_defaults().build(&config, table).await?;
//! let connection = connector.create_connection().await?;
//! ```

#[cfg(unix)]
mod serial;
mod tcp;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::connection::{Connection, ConnectionTable};
use crate::error::{BridgeError, Result};
use crate::handler::BoxFuture;
use crate::transport::TransportKind;

#[cfg(unix)]
pub use serial::SerialConnector;
pub use tcp::TcpConnector;

/// Factory for connections over one medium.
pub trait Connector: Send + Sync {
    /// Medium of the connections this connector creates.
    fn kind(&self) -> TransportKind;

    /// Establish a new connection.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ResourceExhausted`] if no transport handle can be
    /// obtained.
    fn create_connection(&self) -> BoxFuture<'_, Result<Connection>>;

    /// Whether another connection may be created while one is live.
    ///
    /// A dialed socket or an opened device serves one session at a time.
    fn accepts_many(&self) -> bool {
        false
    }
}

/// Builds a connector from configuration.
pub type ConnectorFactory = Box<
    dyn Fn(&BridgeConfig, Arc<ConnectionTable>) -> BoxFuture<'static, Result<Box<dyn Connector>>>
        + Send
        + Sync,
>;

/// Connector factories keyed by transport.
pub struct ConnectorRegistry {
    factories: HashMap<TransportKind, ConnectorFactory>,
}

impl ConnectorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the TCP and serial connectors.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register(TransportKind::Tcp, |config, table| {
            let tcp = config.tcp.clone();
            Box::pin(async move {
                let connector = TcpConnector::from_config(&tcp, table).await?;
                Ok(Box::new(connector) as Box<dyn Connector>)
            })
        });

        #[cfg(unix)]
        registry.register(TransportKind::Serial, |config, table| {
            let connector = SerialConnector::new(config.serial.device.clone(), table);
            Box::pin(async move { Ok(Box::new(connector) as Box<dyn Connector>) })
        });

        registry
    }

    /// Register a factory for `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: TransportKind, factory: F)
    where
        F: Fn(&BridgeConfig, Arc<ConnectionTable>) -> BoxFuture<'static, Result<Box<dyn Connector>>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    /// Check if a factory is registered for `kind`.
    pub fn contains(&self, kind: TransportKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Build the connector selected by `config.transport`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::UnknownTransport`] if nothing is registered for the
    /// configured kind, otherwise whatever the factory reports.
    pub async fn build(
        &self,
        config: &BridgeConfig,
        table: Arc<ConnectionTable>,
    ) -> Result<Box<dyn Connector>> {
        let factory = self
            .factories
            .get(&config.transport)
            .ok_or(BridgeError::UnknownTransport(config.transport))?;

        let connector = factory(config, table).await?;
        tracing::info!(transport = %config.transport, "connector ready");
        Ok(connector)
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Map an establishment failure to `ResourceExhausted`.
pub(crate) fn exhausted(kind: TransportKind) -> impl FnOnce(std::io::Error) -> BridgeError {
    move |source| BridgeError::ResourceExhausted { kind, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    struct MemoryConnector {
        table: Arc<ConnectionTable>,
    }

    impl Connector for MemoryConnector {
        fn kind(&self) -> TransportKind {
            TransportKind::Memory
        }

        fn create_connection(&self) -> BoxFuture<'_, Result<Connection>> {
            Box::pin(async move {
                let (transport, _host) = MemoryTransport::pair(64);
                Ok(Connection::new(transport, self.table.clone()))
            })
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_defaults_register_tcp_and_serial() {
        let registry = ConnectorRegistry::with_defaults();
        assert!(registry.contains(TransportKind::Tcp));
        assert!(registry.contains(TransportKind::Serial));
        assert!(!registry.contains(TransportKind::Memory));
    }

    #[tokio::test]
    async fn test_build_unknown_transport() {
        let registry = ConnectorRegistry::with_defaults();
        let config = BridgeConfig {
            transport: TransportKind::Memory,
            ..BridgeConfig::default()
        };

        let result = registry
            .build(&config, Arc::new(ConnectionTable::new()))
            .await;
        assert!(matches!(
            result,
            Err(BridgeError::UnknownTransport(TransportKind::Memory))
        ));
    }

    #[tokio::test]
    async fn test_build_selects_configured_kind() {
        let mut registry = ConnectorRegistry::with_defaults();
        registry.register(TransportKind::Memory, |_config, table| {
            Box::pin(async move { Ok(Box::new(MemoryConnector { table }) as Box<dyn Connector>) })
        });

        let table = Arc::new(ConnectionTable::new());
        let config = BridgeConfig {
            transport: TransportKind::Memory,
            ..BridgeConfig::default()
        };
        let connector = registry.build(&config, table.clone()).await.unwrap();
        assert_eq!(connector.kind(), TransportKind::Memory);

        let first = connector.create_connection().await.unwrap();
        let second = connector.create_connection().await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(table.len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_serial_is_lazy() {
        let registry = ConnectorRegistry::with_defaults();
        let mut config = BridgeConfig::default();
        config.transport = TransportKind::Serial;
        config.serial.device = "/nonexistent/tty".into();

        // The device is only opened by create_connection.
        let connector = registry
            .build(&config, Arc::new(ConnectionTable::new()))
            .await
            .unwrap();
        assert_eq!(connector.kind(), TransportKind::Serial);
    }
}
