/*!
 # BLE RGBW Light Controller Library

 A Rust library for discovering Bluetooth LE peripherals, holding a single
 connection session to one of them and driving its RGBW light through a
 GATT characteristic.

 ## Features

 * Time-bounded, deduplicated device discovery
 * Single-session connection management with disconnect subscriptions
 * Firmware version and battery level reads
 * RGBW color writes using the `[0x01, R, G, B, W]` command frame
 * Per-view session controller with debug counters

 ## Example

 ```no_run
 use std::sync::Arc;
 use ble_rgbw_controller::*;

 #[tokio::main]
 async fn main() -> Result<()> {
     // Initialize tracing for logs
     tracing_subscriber::fmt::init();

     let transport = Arc::new(BtleTransport::new().await?);
     let mut scanner = Scanner::new(transport.clone(), DEFAULT_SCAN_TIMEOUT);
     let mut events = scanner.start_scan(DeviceFilter::Named).await?;
     let device = loop {
         match events.recv().await {
             Some(ScanEvent::Discovered(device)) => break device,
             Some(_) => continue,
             None => return Err(Error::Scan("no device found".into())),
         }
     };
     scanner.stop_scan().await?;

     let manager = Arc::new(ConnectionManager::new(transport));
     let counters = Arc::new(DebugCounters::default());
     let session = DeviceSession::open(device, manager, counters, SessionConfig::default()).await;
     session.connect().await?;
     session.change_color(ColorChange::Hex("#FF0000".into()));
     session.flush_writes().await;

     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Custom error types for the RGBW controller library
#[derive(Error, Debug)]
pub enum Error {
    /// No Bluetooth adapters found
    #[error("No Bluetooth adapters found")]
    NoBluetoothAdapters,

    /// The adapter exists but is not powered on
    #[error("Bluetooth adapter is not available (state: {0})")]
    AdapterUnavailable(String),

    /// Platform Bluetooth permissions were not granted
    #[error("Bluetooth permission denied: {0}")]
    PermissionDenied(String),

    /// Discovery failed and the scan was aborted
    #[error("Scan failed: {0}")]
    Scan(String),

    /// Connect or capability discovery failed
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The operation needs an established session
    #[error("No device connected")]
    NotConnected,

    /// Another connect or disconnect is still in flight
    #[error("Another connection operation is in progress")]
    OperationInProgress,

    /// Failed to find required BLE characteristic
    #[error("Could not find required BLE characteristic: {0}")]
    CharacteristicNotFound(uuid::Uuid),

    /// Characteristic read failed
    #[error("Read failed: {0}")]
    Read(String),

    /// Characteristic write failed
    #[error("Write failed: {0}")]
    Write(String),

    /// Value out of range
    #[error("Value {0} out of range ({1}..{2})")]
    ValueOutOfRange(i64, i64, i64),

    /// Payload text could not be transcoded to bytes
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Bytes do not form a known command frame
    #[error("Invalid command frame: {0}")]
    InvalidFrame(String),

    /// Error from btleplug
    #[error(transparent)]
    BtlePlugError(#[from] btleplug::Error),
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Aborts the current scan
    Scan,
    /// Session was not established
    Connection,
    /// Degrades to an unknown value
    Read,
    /// Counted, non-fatal
    Write,
    /// Frame or payload encoding problem
    Codec,
    /// Unclassified transport failure
    Transport,
}

impl Error {
    /// Classifies the error. Permission and adapter problems surface as
    /// connection errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Scan(_) => ErrorKind::Scan,
            Error::NoBluetoothAdapters
            | Error::AdapterUnavailable(_)
            | Error::PermissionDenied(_)
            | Error::Connection(_)
            | Error::NotConnected
            | Error::OperationInProgress => ErrorKind::Connection,
            Error::Read(_) | Error::CharacteristicNotFound(_) => ErrorKind::Read,
            Error::Write(_) => ErrorKind::Write,
            Error::ValueOutOfRange(..) | Error::InvalidPayload(_) | Error::InvalidFrame(_) => {
                ErrorKind::Codec
            }
            Error::BtlePlugError(_) => ErrorKind::Transport,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod attributes;
pub mod btle;
pub mod codec;
pub mod connection;
pub mod scanner;
pub mod services;
pub mod session;
pub mod transport;

#[cfg(test)]
mod fake;

// Re-export key types
pub use attributes::AttributeAccessor;
pub use btle::BtleTransport;
pub use codec::{decode_hex_color, Opcode, Rgb, RgbwCommand};
pub use connection::{ConnectionManager, ConnectionState};
pub use scanner::{
    DeviceFilter, ScanEvent, ScanState, ScanStopReason, Scanner, DEFAULT_SCAN_TIMEOUT,
    EXTENDED_SCAN_TIMEOUT,
};
pub use services::{ServiceDescriptor, Services, SERVICES};
pub use session::{
    Channel, ColorChange, ColorView, DebugCounters, DebugView, DeviceSession, SessionConfig,
    StatusView, WriteOrdering,
};
pub use transport::{
    Device, DeviceId, DisconnectListener, DisconnectRegistry, Subscription, Transport,
};
