//! Event sink for the serial state machine.
//! Consumers implement only the callbacks they care about; every method has
//! an empty default body.

use log::debug;
use tokio::sync::mpsc;

use crate::core::serial::error::SerialError;
use crate::core::serial::types::{AdapterState, Peripheral};

/// Observer of scan and connection progress
pub trait SerialDelegate: Send {
    /// A peripheral was seen by the scan, or was already connected to the
    /// system when the scan started (in which case `rssi` is `None`)
    fn on_discovered(&mut self, _peripheral: &Peripheral, _rssi: Option<i16>) {}

    /// The serial characteristic was found and subscribed; fires once per connection
    fn on_ready(&mut self, _peripheral: &Peripheral) {}

    fn on_state_changed(&mut self, _state: AdapterState) {}

    /// The attempt started by `connect` ended without a usable link
    fn on_connect_failed(&mut self, _peripheral: &Peripheral, _error: &SerialError) {}

    fn on_disconnected(&mut self, _peripheral: &Peripheral) {}

    /// Data notified by the peripheral on the serial characteristic
    fn on_received(&mut self, _peripheral: &Peripheral, _data: &[u8]) {}

    /// Acknowledgment of a write sent in `WithResponse` mode
    fn on_write_completed(&mut self, _peripheral: &Peripheral, _result: Result<(), SerialError>) {}

    fn on_rssi(&mut self, _peripheral: &Peripheral, _rssi: i16) {}
}

/// Owned form of every [`SerialDelegate`] callback
#[derive(Debug, Clone, PartialEq)]
pub enum SerialEvent {
    Discovered { peripheral: Peripheral, rssi: Option<i16> },
    Ready(Peripheral),
    StateChanged(AdapterState),
    ConnectFailed { peripheral: Peripheral, error: SerialError },
    Disconnected(Peripheral),
    Received { peripheral: Peripheral, data: Vec<u8> },
    WriteCompleted { peripheral: Peripheral, result: Result<(), SerialError> },
    Rssi { peripheral: Peripheral, rssi: i16 },
}

impl SerialEvent {
    /// Replays the event onto a delegate
    pub fn dispatch(&self, delegate: &mut dyn SerialDelegate) {
        match self {
            Self::Discovered { peripheral, rssi } => delegate.on_discovered(peripheral, *rssi),
            Self::Ready(peripheral) => delegate.on_ready(peripheral),
            Self::StateChanged(state) => delegate.on_state_changed(*state),
            Self::ConnectFailed { peripheral, error } => delegate.on_connect_failed(peripheral, error),
            Self::Disconnected(peripheral) => delegate.on_disconnected(peripheral),
            Self::Received { peripheral, data } => delegate.on_received(peripheral, data),
            Self::WriteCompleted { peripheral, result } => {
                delegate.on_write_completed(peripheral, result.clone())
            }
            Self::Rssi { peripheral, rssi } => delegate.on_rssi(peripheral, *rssi),
        }
    }
}

/// Forwards every callback into a channel for async consumers
pub struct ChannelDelegate {
    sender: mpsc::UnboundedSender<SerialEvent>,
}

impl ChannelDelegate {
    /// Creates the delegate together with the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SerialEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn forward(&self, event: SerialEvent) {
        if self.sender.send(event).is_err() {
            debug!("Serial event receiver dropped, event discarded");
        }
    }
}

impl SerialDelegate for ChannelDelegate {
    fn on_discovered(&mut self, peripheral: &Peripheral, rssi: Option<i16>) {
        self.forward(SerialEvent::Discovered {
            peripheral: peripheral.clone(),
            rssi,
        });
    }

    fn on_ready(&mut self, peripheral: &Peripheral) {
        self.forward(SerialEvent::Ready(peripheral.clone()));
    }

    fn on_state_changed(&mut self, state: AdapterState) {
        self.forward(SerialEvent::StateChanged(state));
    }

    fn on_connect_failed(&mut self, peripheral: &Peripheral, error: &SerialError) {
        self.forward(SerialEvent::ConnectFailed {
            peripheral: peripheral.clone(),
            error: error.clone(),
        });
    }

    fn on_disconnected(&mut self, peripheral: &Peripheral) {
        self.forward(SerialEvent::Disconnected(peripheral.clone()));
    }

    fn on_received(&mut self, peripheral: &Peripheral, data: &[u8]) {
        self.forward(SerialEvent::Received {
            peripheral: peripheral.clone(),
            data: data.to_vec(),
        });
    }

    fn on_write_completed(&mut self, peripheral: &Peripheral, result: Result<(), SerialError>) {
        self.forward(SerialEvent::WriteCompleted {
            peripheral: peripheral.clone(),
            result,
        });
    }

    fn on_rssi(&mut self, peripheral: &Peripheral, rssi: i16) {
        self.forward(SerialEvent::Rssi {
            peripheral: peripheral.clone(),
            rssi,
        });
    }
}
