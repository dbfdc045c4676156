//! Block devices and the handlers that serve them.
//!
//! [`BlockDevice`] is the seam to whatever actually stores the blocks. The
//! [`DeviceTable`] numbers devices from unit 1 (unit 0 addresses the bus
//! itself) and answers the block-level SmartPort commands against them.

use std::future::ready;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::BridgeError;
use crate::handler::{HandlerRegistry, HandlerResult};
use crate::protocol::{u24_bytes, Command, Request, RequestBody, StatusCode, BLOCK_SIZE};

/// Units a table can hold; unit 0 is the bus itself.
pub const MAX_UNITS: usize = 255;

/// Largest block count a status block can report.
pub const MAX_BLOCK_COUNT: u32 = 0x00FF_FFFF;

/// Status code asking for the general device status.
pub const STATUS_DEVICE: u8 = 0x00;
/// Status code asking for the device information block.
pub const STATUS_DIB: u8 = 0x03;

/// Control code resetting a device.
pub const CONTROL_RESET: u8 = 0x00;
/// Control code ejecting the medium.
pub const CONTROL_EJECT: u8 = 0x04;

const NAME_LEN: usize = 16;
const DEVICE_TYPE_HARD_DISK: u8 = 0x02;
const DEVICE_SUBTYPE_REMOVABLE: u8 = 0x20;
const FIRMWARE_VERSION: u16 = 0x0100;

// General status byte bits.
const STAT_BLOCK_DEVICE: u8 = 0x80;
const STAT_WRITE_ALLOWED: u8 = 0x40;
const STAT_READ_ALLOWED: u8 = 0x20;
const STAT_ONLINE: u8 = 0x10;
const STAT_FORMAT_ALLOWED: u8 = 0x08;
const STAT_WRITE_PROTECTED: u8 = 0x04;

/// Storage backend for one unit.
///
/// Failures are reported as the status the host should see.
pub trait BlockDevice: Send + Sync + 'static {
    /// Name reported in the device information block.
    fn name(&self) -> &str;

    /// Number of 512-byte blocks.
    fn block_count(&self) -> u32;

    /// Whether writes and FORMAT are refused.
    fn is_write_protected(&self) -> bool;

    /// Whether a medium is present.
    fn is_online(&self) -> bool;

    /// Read one block.
    fn read_block(&self, block: u32) -> Result<Bytes, StatusCode>;

    /// Overwrite one block. `data` is exactly [`BLOCK_SIZE`] bytes.
    fn write_block(&self, block: u32, data: &[u8]) -> Result<(), StatusCode>;

    /// Zero the whole device.
    fn format(&self) -> Result<(), StatusCode>;
}

/// Disk image held in memory.
pub struct MemoryDisk {
    name: String,
    data: RwLock<Vec<u8>>,
    write_protected: AtomicBool,
    online: AtomicBool,
}

impl MemoryDisk {
    /// Blank disk of `block_count` blocks.
    pub fn new(name: impl Into<String>, block_count: u32) -> Self {
        let block_count = block_count.min(MAX_BLOCK_COUNT) as usize;
        Self::with_data(name.into(), vec![0; block_count * BLOCK_SIZE])
    }

    /// Disk backed by a raw image. A trailing partial block is zero-padded.
    pub fn from_image(name: impl Into<String>, mut image: Vec<u8>) -> Self {
        let blocks = image.len().div_ceil(BLOCK_SIZE).min(MAX_BLOCK_COUNT as usize);
        image.resize(blocks * BLOCK_SIZE, 0);
        Self::with_data(name.into(), image)
    }

    fn with_data(name: String, data: Vec<u8>) -> Self {
        Self {
            name,
            data: RwLock::new(data),
            write_protected: AtomicBool::new(false),
            online: AtomicBool::new(true),
        }
    }

    /// Set or clear write protection.
    pub fn set_write_protected(&self, protected: bool) {
        self.write_protected.store(protected, Ordering::Relaxed);
    }

    /// Insert or remove the medium.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// Copy of the whole image.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn range(&self, block: u32) -> Result<std::ops::Range<usize>, StatusCode> {
        if block >= self.block_count() {
            return Err(StatusCode::BAD_BLOCK);
        }
        let start = block as usize * BLOCK_SIZE;
        Ok(start..start + BLOCK_SIZE)
    }
}

impl BlockDevice for MemoryDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_count(&self) -> u32 {
        let len = self
            .data
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len();
        (len / BLOCK_SIZE) as u32
    }

    fn is_write_protected(&self) -> bool {
        self.write_protected.load(Ordering::Relaxed)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    fn read_block(&self, block: u32) -> Result<Bytes, StatusCode> {
        let range = self.range(block)?;
        let data = self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(Bytes::copy_from_slice(&data[range]))
    }

    fn write_block(&self, block: u32, data: &[u8]) -> Result<(), StatusCode> {
        if data.len() != BLOCK_SIZE {
            return Err(StatusCode::BAD_PARAMETER_COUNT);
        }
        let range = self.range(block)?;
        let mut image = self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        image[range].copy_from_slice(data);
        Ok(())
    }

    fn format(&self) -> Result<(), StatusCode> {
        let mut image = self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        image.fill(0);
        Ok(())
    }
}

/// Devices addressed by unit number.
#[derive(Clone, Default)]
pub struct DeviceTable {
    devices: Vec<Arc<dyn BlockDevice>>,
}

impl DeviceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a device and return its unit number.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Config`] once [`MAX_UNITS`] devices are installed.
    pub fn add(&mut self, device: Arc<dyn BlockDevice>) -> crate::Result<u8> {
        if self.devices.len() >= MAX_UNITS {
            return Err(BridgeError::Config(format!(
                "device table is full ({} units)",
                MAX_UNITS
            )));
        }
        self.devices.push(device);
        Ok(self.devices.len() as u8)
    }

    /// Builder-style [`add`](Self::add). A device past [`MAX_UNITS`] is
    /// logged and left out.
    pub fn with_device(mut self, device: Arc<dyn BlockDevice>) -> Self {
        if let Err(e) = self.add(device) {
            tracing::warn!("device not added: {}", e);
        }
        self
    }

    /// Number of installed devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if no device is installed.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device at `unit`, if any.
    pub fn get(&self, unit: u8) -> Option<&Arc<dyn BlockDevice>> {
        match unit {
            0 => None,
            unit => self.devices.get(unit as usize - 1),
        }
    }

    /// Register handlers for every block command this table answers.
    ///
    /// Byte-level READ and WRITE stay unregistered and are answered as
    /// unsupported.
    pub fn install(&self, registry: &mut HandlerRegistry) {
        let table = Arc::new(self.clone());
        for command in [
            Command::Status,
            Command::ReadBlock,
            Command::WriteBlock,
            Command::Format,
            Command::Control,
            Command::Init,
            Command::Open,
            Command::Close,
        ] {
            let table = table.clone();
            registry.register(command, move |request| ready(table.handle(&request)));
        }
        tracing::debug!(devices = self.len(), "device handlers installed");
    }

    /// Answer one request.
    pub fn handle(&self, request: &Request) -> HandlerResult {
        match &request.body {
            RequestBody::Status { unit: 0, status_code } => self.bus_status(*status_code),
            RequestBody::Status { unit, status_code } => {
                let device = self.device(*unit)?;
                match *status_code {
                    STATUS_DEVICE => Ok(device_status(device.as_ref())),
                    STATUS_DIB => Ok(device_information(device.as_ref())),
                    _ => Err(StatusCode::BAD_CONTROL),
                }
            }
            RequestBody::ReadBlock { unit, block } => {
                let device = self.online_device(*unit)?;
                device.read_block(*block)
            }
            RequestBody::WriteBlock { unit, block, data } => {
                let device = self.writable_device(*unit)?;
                device.write_block(*block, data)?;
                Ok(Bytes::new())
            }
            RequestBody::Format { unit } => {
                let device = self.writable_device(*unit)?;
                device.format()?;
                Ok(Bytes::new())
            }
            RequestBody::Control {
                unit, control_code, ..
            } => {
                self.device(*unit)?;
                match *control_code {
                    CONTROL_RESET | CONTROL_EJECT => Ok(Bytes::new()),
                    _ => Err(StatusCode::BAD_CONTROL),
                }
            }
            // INIT addresses the whole bus.
            RequestBody::Init { .. } => Ok(Bytes::new()),
            RequestBody::Open { unit } | RequestBody::Close { unit } => {
                self.device(*unit)?;
                Ok(Bytes::new())
            }
            RequestBody::Read { .. } | RequestBody::Write { .. } | RequestBody::Unknown { .. } => {
                Err(StatusCode::BAD_COMMAND)
            }
        }
    }

    fn device(&self, unit: u8) -> Result<&Arc<dyn BlockDevice>, StatusCode> {
        self.get(unit).ok_or(StatusCode::BAD_UNIT)
    }

    fn online_device(&self, unit: u8) -> Result<&Arc<dyn BlockDevice>, StatusCode> {
        let device = self.device(unit)?;
        if !device.is_online() {
            return Err(StatusCode::OFFLINE);
        }
        Ok(device)
    }

    fn writable_device(&self, unit: u8) -> Result<&Arc<dyn BlockDevice>, StatusCode> {
        let device = self.online_device(unit)?;
        if device.is_write_protected() {
            return Err(StatusCode::WRITE_PROTECTED);
        }
        Ok(device)
    }

    /// Driver status: device count, then interrupt and reserved bytes.
    fn bus_status(&self, status_code: u8) -> HandlerResult {
        if status_code != STATUS_DEVICE {
            return Err(StatusCode::BAD_CONTROL);
        }
        let mut status = [0u8; 8];
        // `add` keeps the count within a byte.
        status[0] = self.devices.len() as u8;
        Ok(Bytes::copy_from_slice(&status))
    }
}

fn status_byte(device: &dyn BlockDevice) -> u8 {
    let mut status = STAT_BLOCK_DEVICE | STAT_READ_ALLOWED | STAT_FORMAT_ALLOWED;
    if device.is_online() {
        status |= STAT_ONLINE;
    }
    if device.is_write_protected() {
        status |= STAT_WRITE_PROTECTED;
    } else {
        status |= STAT_WRITE_ALLOWED;
    }
    status
}

fn device_status(device: &dyn BlockDevice) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(status_byte(device));
    buf.put_slice(&u24_bytes(device.block_count()));
    buf.freeze()
}

fn device_information(device: &dyn BlockDevice) -> Bytes {
    let name = device.name().as_bytes();
    let name_len = name.len().min(NAME_LEN);

    let mut buf = BytesMut::with_capacity(25);
    buf.put_u8(status_byte(device));
    buf.put_slice(&u24_bytes(device.block_count()));
    buf.put_u8(name_len as u8);
    buf.put_slice(&name[..name_len]);
    buf.put_bytes(b' ', NAME_LEN - name_len);
    buf.put_u8(DEVICE_TYPE_HARD_DISK);
    buf.put_u8(DEVICE_SUBTYPE_REMOVABLE);
    buf.put_u16_le(FIRMWARE_VERSION);
    buf.freeze()
}
