//! The seam between the state machine and a platform Bluetooth stack.
//!
//! Commands are fire-and-forget: an `Adapter` returns immediately and reports
//! the outcome later as an [`AdapterEvent`]. Events must be fed back to
//! [`BluetoothSerial::handle_event`](crate::core::serial::BluetoothSerial::handle_event)
//! one at a time, in the order the adapter produced them.

use uuid::Uuid;

use crate::core::serial::error::SerialError;
use crate::core::serial::types::{
    AdapterState, CharacteristicHandle, Peripheral, PeripheralId, ServiceHandle, WriteMode,
};

/// Central-role commands the state machine issues
pub trait Adapter: Send {
    /// Current radio power state
    fn state(&self) -> AdapterState;

    /// Starts scanning. An empty `services` slice means an unfiltered scan.
    fn start_scan(&mut self, services: &[Uuid]) -> Result<(), SerialError>;

    fn stop_scan(&mut self);

    /// Requests the peripherals already connected to the system that expose
    /// one of `services`; answered with [`AdapterEvent::ConnectedPeripherals`].
    fn retrieve_connected(&mut self, services: &[Uuid]) -> Result<(), SerialError>;

    fn connect(&mut self, peripheral: &Peripheral) -> Result<(), SerialError>;

    /// Cancels a pending connect or tears down an established link.
    /// Every accepted call is answered with one [`AdapterEvent::Disconnected`].
    fn disconnect(&mut self, peripheral: &Peripheral) -> Result<(), SerialError>;

    fn discover_services(&mut self, peripheral: &Peripheral, services: &[Uuid]) -> Result<(), SerialError>;

    fn discover_characteristics(
        &mut self,
        peripheral: &Peripheral,
        service: &ServiceHandle,
        characteristics: &[Uuid],
    ) -> Result<(), SerialError>;

    fn set_notify(
        &mut self,
        peripheral: &Peripheral,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), SerialError>;

    fn write(
        &mut self,
        peripheral: &Peripheral,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), SerialError>;

    fn read_rssi(&mut self, peripheral: &Peripheral) -> Result<(), SerialError>;
}

/// Asynchronous notifications produced by an [`Adapter`]
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    StateChanged(AdapterState),
    Discovered {
        peripheral: Peripheral,
        rssi: Option<i16>,
    },
    ConnectedPeripherals(Vec<Peripheral>),
    Connected(PeripheralId),
    ConnectFailed {
        peripheral: PeripheralId,
        reason: String,
    },
    Disconnected {
        peripheral: PeripheralId,
        reason: Option<String>,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        result: Result<Vec<ServiceHandle>, String>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: ServiceHandle,
        result: Result<Vec<CharacteristicHandle>, String>,
    },
    ValueUpdated {
        peripheral: PeripheralId,
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    },
    WriteCompleted {
        peripheral: PeripheralId,
        characteristic: CharacteristicHandle,
        result: Result<(), String>,
    },
    RssiRead {
        peripheral: PeripheralId,
        result: Result<i16, String>,
    },
}
