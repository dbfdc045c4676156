//! Bridge daemon - serve a disk image to a SmartPort host.
//!
//! This example demonstrates:
//! - Loading a JSON configuration
//! - Serving a disk image through a `DeviceTable`
//! - Stopping cleanly on Ctrl-C
//!
//! # Running
//!
//! ```text
//! RUST_LOG=smartport_bridge=debug cargo run --example bridge -- bridge.json disk.po
//! ```
//!
//! Both arguments are optional: without a config file the bridge listens on
//! 127.0.0.1:1985, without an image it serves a blank 800K disk.
//!
//! ```json
//! {
//!     "transport": "tcp",
//!     "tcp": { "mode": "listen", "address": "0.0.0.0:1985" },
//!     "engine": { "replay_duplicates": true },
//!     "reconnect_delay_ms": 1000
//! }
//! ```

use std::sync::Arc;

use smartport_bridge::config::BridgeConfig;
use smartport_bridge::device::{DeviceTable, MemoryDisk};
use smartport_bridge::Bridge;

/// Blocks in an 800K floppy image.
const BLANK_DISK_BLOCKS: u32 = 1600;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish(),
    )?;

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    let disk = match args.next() {
        Some(path) => {
            let image = tokio::fs::read(&path).await?;
            MemoryDisk::from_image(volume_name(&path), image)
        }
        None => MemoryDisk::new("BLANK", BLANK_DISK_BLOCKS),
    };

    let bridge = Arc::new(
        Bridge::builder()
            .config(config)
            .devices(DeviceTable::new().with_device(Arc::new(disk)))
            .build()?,
    );

    let stopper = bridge.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.shutdown();
        }
    });

    bridge.run().await?;
    Ok(())
}

/// Upper-cased file stem, as a host would show it.
fn volume_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_uppercase())
        .unwrap_or_else(|| "DISK".to_string())
}
