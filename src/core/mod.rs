//! Core functionality for the HM-10 serial bridge
//! This module contains the connection state machine and its adapters

pub mod serial;

// Re-export commonly used types
pub use serial::{BluetoothSerial, SerialDelegate, SerialSession, SessionHandle};
