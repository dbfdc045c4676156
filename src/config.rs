//! Bridge configuration.
//!
//! Loaded from JSON; every section and field has a default, so an empty
//! object is a valid configuration (TCP listener on port 1985).
//!
//! ```
//! use smartport_bridge::config::BridgeConfig;
//! use smartport_bridge::transport::TransportKind;
//!
//! let config = BridgeConfig::from_json_str(r#"{ "transport": "serial",
//!     "serial": { "device": "/dev/ttyS1" } }"#).unwrap();
//! assert_eq!(config.transport, TransportKind::Serial);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::protocol::{BLOCK_SIZE, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use crate::transport::TransportKind;

/// Default TCP address.
pub const DEFAULT_TCP_ADDRESS: &str = "127.0.0.1:1985";

/// Default serial device.
pub const DEFAULT_SERIAL_DEVICE: &str = "/dev/ttyUSB0";

/// Default size of one transport read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default number of inbound chunks queued between reader task and engine.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Default pause before retrying a failed `create_connection`.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Largest legal request: WriteBlock header, unit, block number, one block.
const MIN_FRAME_LIMIT: usize = HEADER_SIZE + 4 + BLOCK_SIZE;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Which connector is active.
    pub transport: TransportKind,
    pub tcp: TcpConfig,
    pub serial: SerialConfig,
    pub engine: EngineConfig,
    /// Pause before retrying after a connector failure.
    pub reconnect_delay_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            tcp: TcpConfig::default(),
            serial: SerialConfig::default(),
            engine: EngineConfig::default(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if self.transport == TransportKind::Serial && self.serial.device.as_os_str().is_empty() {
            return Err(BridgeError::Config("serial.device is empty".into()));
        }
        Ok(())
    }

    /// Reconnect delay as a `Duration`.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Whether the TCP connector waits for the host or dials it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcpMode {
    #[default]
    Listen,
    Connect,
}

/// TCP connector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub mode: TcpMode,
    /// Address to bind (listen) or dial (connect).
    pub address: String,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mode: TcpMode::Listen,
            address: DEFAULT_TCP_ADDRESS.to_string(),
        }
    }
}

/// Serial connector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub device: PathBuf,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_SERIAL_DEVICE),
        }
    }
}

/// Per-session engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes requested per transport read.
    pub read_buffer_size: usize,
    /// Largest unescaped frame accepted before resynchronizing.
    pub max_frame_size: usize,
    /// Inbound chunks buffered between the reader task and the engine.
    pub channel_capacity: usize,
    /// Answer a repeated request from the cached response instead of
    /// running it again.
    pub replay_duplicates: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            replay_duplicates: true,
        }
    }
}

impl EngineConfig {
    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(BridgeError::Config("engine.read_buffer_size must be > 0".into()));
        }
        if self.channel_capacity == 0 {
            return Err(BridgeError::Config("engine.channel_capacity must be > 0".into()));
        }
        if self.max_frame_size < MIN_FRAME_LIMIT {
            return Err(BridgeError::Config(format!(
                "engine.max_frame_size must be at least {} bytes",
                MIN_FRAME_LIMIT
            )));
        }
        Ok(())
    }
}
