//! TCP connector.
//!
//! In listen mode every `create_connection` accepts one host; in connect
//! mode it dials the configured address once.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use super::{exhausted, Connector};
use crate::config::{TcpConfig, TcpMode};
use crate::connection::{Connection, ConnectionTable};
use crate::error::Result;
use crate::handler::BoxFuture;
use crate::transport::{TcpTransport, TransportKind};

enum Endpoint {
    Listen(TcpListener),
    Connect(String),
}

/// Connector producing TCP connections.
pub struct TcpConnector {
    endpoint: Endpoint,
    table: Arc<ConnectionTable>,
}

impl TcpConnector {
    /// Bind a listener on `address`.
    pub async fn bind(address: &str, table: Arc<ConnectionTable>) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(exhausted(TransportKind::Tcp))?;
        tracing::info!(address = %listener.local_addr()?, "listening for hosts");
        Ok(Self {
            endpoint: Endpoint::Listen(listener),
            table,
        })
    }

    /// Dial `address` on every `create_connection`.
    pub fn dial(address: impl Into<String>, table: Arc<ConnectionTable>) -> Self {
        Self {
            endpoint: Endpoint::Connect(address.into()),
            table,
        }
    }

    /// Build from the `tcp` config section.
    pub async fn from_config(config: &TcpConfig, table: Arc<ConnectionTable>) -> Result<Self> {
        match config.mode {
            TcpMode::Listen => Self::bind(&config.address, table).await,
            TcpMode::Connect => Ok(Self::dial(config.address.clone(), table)),
        }
    }

    /// Bound address in listen mode.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.endpoint {
            Endpoint::Listen(listener) => listener.local_addr().ok(),
            Endpoint::Connect(_) => None,
        }
    }

    async fn establish(&self) -> Result<Connection> {
        let stream = match &self.endpoint {
            Endpoint::Listen(listener) => {
                let (stream, addr) = listener
                    .accept()
                    .await
                    .map_err(exhausted(TransportKind::Tcp))?;
                tracing::debug!(%addr, "host connected");
                stream
            }
            Endpoint::Connect(address) => TcpStream::connect(address.as_str())
                .await
                .map_err(exhausted(TransportKind::Tcp))?,
        };

        let transport = TcpTransport::new(stream).map_err(exhausted(TransportKind::Tcp))?;
        Ok(Connection::new(transport, self.table.clone()))
    }
}

impl Connector for TcpConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn create_connection(&self) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(self.establish())
    }

    fn accepts_many(&self) -> bool {
        matches!(self.endpoint, Endpoint::Listen(_))
    }
}
