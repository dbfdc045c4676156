//! # smartport-bridge
//!
//! SmartPort block-storage bus protocol carried over SLIP-framed byte
//! streams.
//!
//! A host that only speaks SmartPort sends its packets over a TCP socket or
//! a serial line; the bridge splits the stream into frames, decodes the
//! requests, answers them from registered handlers (usually a
//! [`DeviceTable`](device::DeviceTable) of block devices) and writes the
//! framed responses back.
//!
//! ## Architecture
//!
//! - **Connector**: creates one [`Connection`](connection::Connection) per
//!   session over the configured transport
//! - **Engine**: one per connection; strict request/response ordering,
//!   framing noise skipped, transport failure ends the session
//! - **Handlers**: one per command, keyed by [`Command`](protocol::Command)
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use smartport_bridge::device::{DeviceTable, MemoryDisk};
//! use smartport_bridge::Bridge;
//!
//! #[tokio::main]
//! async fn main() -> smartport_bridge::Result<()> {
//!     let bridge = Bridge::builder()
//!         .devices(DeviceTable::new().with_device(Arc::new(MemoryDisk::new("DISK1", 1600))))
//!         .build()?;
//!
//!     bridge.run().await
//! }
//! ```

pub mod config;
pub mod connection;
pub mod connector;
pub mod device;
pub mod engine;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;

mod bridge;

pub use bridge::{Bridge, BridgeBuilder};
pub use error::{BridgeError, Result};
