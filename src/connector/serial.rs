//! Serial connector.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{exhausted, Connector};
use crate::connection::{Connection, ConnectionTable};
use crate::error::Result;
use crate::handler::BoxFuture;
use crate::transport::{SerialTransport, TransportKind};

/// Connector opening a serial device file.
///
/// Each `create_connection` opens the device again, so a session that
/// ended on a yanked adapter can be retried once it is plugged back in.
pub struct SerialConnector {
    device: PathBuf,
    table: Arc<ConnectionTable>,
}

impl SerialConnector {
    /// Create a connector for `device`. Nothing is opened yet.
    pub fn new(device: impl Into<PathBuf>, table: Arc<ConnectionTable>) -> Self {
        Self {
            device: device.into(),
            table,
        }
    }

    /// Device path.
    pub fn device(&self) -> &Path {
        &self.device
    }

    async fn open(&self) -> Result<Connection> {
        // Non-blocking open: a tty waiting for carrier would hang otherwise.
        let port = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(&self.device)
            .map_err(exhausted(TransportKind::Serial))?;
        let transport =
            SerialTransport::new(port, &self.device).map_err(exhausted(TransportKind::Serial))?;

        tracing::debug!(device = %self.device.display(), "serial device opened");
        Ok(Connection::new(transport, self.table.clone()))
    }
}

impl Connector for SerialConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn create_connection(&self) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(self.open())
    }
}
