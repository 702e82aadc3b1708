//! Defines shared data structures for the serial module.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::serial::constants::UNKNOWN_DEVICE_NAME;

/// Platform-specific identifier of a peripheral, stable for the adapter's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(pub String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peripheral seen by the adapter.
///
/// This is a reference into the adapter's registry: the adapter resolves the
/// id back to its own device object, and the handle is only usable while the
/// adapter still knows about that device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    /// Platform-specific unique identifier
    pub id: PeripheralId,
    /// The advertised name, if any
    pub name: Option<String>,
    /// MAC address, when the platform exposes one
    pub address: Option<String>,
}

impl Peripheral {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: PeripheralId::new(id),
            name,
            address: None,
        }
    }

    pub fn with_address(mut self, address: Option<String>) -> Self {
        self.address = address;
        self
    }

    /// The name to show to a user
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }
}

/// One entry of a scan result list
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryRecord {
    pub peripheral: Peripheral,
    /// Signal strength in dBm; larger is stronger. Snapshot reports carry none.
    pub rssi: Option<i16>,
}

impl DiscoveryRecord {
    /// Strength used for ordering; a missing reading counts as 0
    pub fn strength(&self) -> i16 {
        self.rssi.unwrap_or(0)
    }
}

/// A GATT service found on the connected peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    /// Adapter-assigned handle, opaque to the state machine
    pub id: u64,
    pub uuid: Uuid,
}

/// Capabilities a characteristic advertises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CharacteristicProperties {
    pub read: bool,
    /// Acknowledged write (write request)
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// A GATT characteristic found inside a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    /// Adapter-assigned handle, opaque to the state machine
    pub id: u64,
    pub uuid: Uuid,
    /// Handle of the service the characteristic belongs to
    pub service: u64,
    pub properties: CharacteristicProperties,
}

/// How payloads are written to the serial characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    /// Write request, the peripheral acknowledges every write
    WithResponse,
    /// Write command, fire-and-forget
    WithoutResponse,
}

impl WriteMode {
    /// Picks the mode for a characteristic: acknowledged writes win when supported
    pub fn for_properties(properties: &CharacteristicProperties) -> Self {
        if properties.write {
            Self::WithResponse
        } else {
            Self::WithoutResponse
        }
    }
}

/// Whether a scan is restricted to peripherals advertising the serial service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Report every advertising peripheral
    All,
    /// Report only peripherals advertising the configured service
    #[default]
    ServiceFiltered,
}

impl ScanMode {
    /// Service UUIDs to hand the adapter; empty means unfiltered
    pub fn filter(self, service: Uuid) -> Vec<Uuid> {
        match self {
            ScanMode::All => Vec::new(),
            ScanMode::ServiceFiltered => vec![service],
        }
    }
}

/// Radio power state reported by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    pub fn is_powered_on(self) -> bool {
        self == Self::PoweredOn
    }
}

/// Lifecycle of the single connection the state machine manages.
///
/// A dropped link goes straight back to `Idle`; there is no separate
/// disconnected state because reconnecting always starts from `Idle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting(PeripheralId),
    DiscoveringServices,
    DiscoveringCharacteristics,
    Ready,
}
