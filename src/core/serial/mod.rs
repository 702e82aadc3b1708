//! BLE serial functionality for HM-10 style modules
//! This module handles scanning for, connecting to, and exchanging data with
//! a peripheral exposing the FFE0/FFE1 serial profile.

mod adapter;
#[cfg(feature = "bluest")]
mod bluest_adapter;
mod constants;
mod delegate;
mod discovery;
mod error;
mod machine;
mod session;
mod types;

// Re-export types that should be publicly accessible
pub use adapter::{Adapter, AdapterEvent};
#[cfg(feature = "bluest")]
pub use bluest_adapter::BluestAdapter;
pub use constants::*; // Re-export all constants
pub use delegate::{ChannelDelegate, SerialDelegate, SerialEvent};
pub use discovery::DiscoveryList;
pub use error::{MissingAttribute, SerialError};
pub use machine::{BluetoothSerial, SerialLink};
pub use session::{SerialSession, SessionHandle, SessionStatus};
pub use types::{
    AdapterState, CharacteristicHandle, CharacteristicProperties, ConnectionState, DiscoveryRecord,
    Peripheral, PeripheralId, ScanMode, ServiceHandle, WriteMode,
};
