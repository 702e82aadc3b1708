//! Constants used by the serial connection
//! This module contains the UUIDs of the HM-10 serial profile and the
//! tuning values used by the session and the console front-end.

use uuid::Uuid;

/// The Bluetooth base UUID that 16-bit and 32-bit UUIDs are expanded over
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34fb);

/// The serial service exposed by almost every HM-10 module (FFE0)
pub const UUID_SERIAL_SERVICE: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// The characteristic inside FFE0 used for both notify and write (FFE1)
pub const UUID_SERIAL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Name shown for peripherals that do not advertise one
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

/// Capacity of the command channel between a `SessionHandle` and its session task
pub const SESSION_COMMAND_CAPACITY: usize = 32;

/// Scan duration in seconds used by the console front-end
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 5;

/// Time the console front-end waits for the link to become ready
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 10;
