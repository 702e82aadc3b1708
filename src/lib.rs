//! HM-10 serial bridge library
//! Scans for, connects to, and exchanges data with BLE serial modules.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod utils;

pub use config::SerialConfig;
pub use crate::core::serial::{
    Adapter, AdapterEvent, AdapterState, BluetoothSerial, ChannelDelegate, ConnectionState,
    DiscoveryList, DiscoveryRecord, Peripheral, PeripheralId, ScanMode, SerialDelegate, SerialError,
    SerialEvent, SerialSession, SessionHandle, WriteMode,
};
#[cfg(feature = "bluest")]
pub use crate::core::serial::BluestAdapter;
