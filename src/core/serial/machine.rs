//! Connection state machine for a single HM-10 style serial peripheral.
//!
//! `BluetoothSerial` owns the lifecycle scan -> connect -> service discovery ->
//! characteristic discovery -> ready. Commands are synchronous and
//! fire-and-forget; their outcomes arrive as [`AdapterEvent`]s through
//! [`BluetoothSerial::handle_event`] and are reported to the registered
//! [`SerialDelegate`].

use std::collections::HashSet;

use log::{debug, error, info, warn};

use crate::config::SerialConfig;
use crate::core::serial::adapter::{Adapter, AdapterEvent};
use crate::core::serial::delegate::{SerialDelegate, SerialEvent};
use crate::core::serial::error::{MissingAttribute, SerialError};
use crate::core::serial::types::{
    AdapterState, CharacteristicHandle, ConnectionState, Peripheral, PeripheralId, ScanMode,
    ServiceHandle, WriteMode,
};

/// The write path of a ready connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialLink {
    pub characteristic: CharacteristicHandle,
    /// Chosen once from the characteristic's properties
    pub write_mode: WriteMode,
}

/// A peripheral the adapter reported as connected
#[derive(Debug, Clone)]
struct Connection {
    peripheral: Peripheral,
    /// Characteristic discoveries requested and not answered yet
    outstanding: usize,
    link: Option<SerialLink>,
}

pub struct BluetoothSerial<A: Adapter> {
    adapter: A,
    config: SerialConfig,
    adapter_state: AdapterState,
    state: ConnectionState,
    /// Whether the adapter was asked to scan and not asked to stop since
    scanning: bool,
    /// Ids already reported during the current scan session
    seen: HashSet<PeripheralId>,
    /// Target of the connect attempt in flight
    pending: Option<Peripheral>,
    connected: Option<Connection>,
    /// Peripherals this machine disconnected whose adapter confirmation is still due
    closing: HashSet<PeripheralId>,
    delegate: Option<Box<dyn SerialDelegate>>,
}

impl<A: Adapter> BluetoothSerial<A> {
    pub fn new(adapter: A, config: SerialConfig) -> Self {
        let adapter_state = adapter.state();
        Self {
            adapter,
            config,
            adapter_state,
            state: ConnectionState::Idle,
            scanning: false,
            seen: HashSet::new(),
            pending: None,
            connected: None,
            closing: HashSet::new(),
            delegate: None,
        }
    }

    /// Registers the observer, replacing any previous one. `None` silences events.
    pub fn set_delegate(&mut self, delegate: Option<Box<dyn SerialDelegate>>) {
        self.delegate = delegate;
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.adapter_state
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Whether a scan session is running. Independent of `state()`: a dropped
    /// connection returns to `Idle` while the scan keeps going.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// True once the serial characteristic is subscribed and writable
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn pending_peripheral(&self) -> Option<&Peripheral> {
        self.pending.as_ref()
    }

    /// The peripheral the adapter reported as connected, ready or not
    pub fn connected_peripheral(&self) -> Option<&Peripheral> {
        self.connected.as_ref().map(|connection| &connection.peripheral)
    }

    pub fn link(&self) -> Option<&SerialLink> {
        self.connected.as_ref().and_then(|connection| connection.link.as_ref())
    }

    pub fn write_mode(&self) -> Option<WriteMode> {
        self.link().map(|link| link.write_mode)
    }

    /// Starts a scan session.
    ///
    /// Peripherals already connected to the system that expose the configured
    /// service are reported as discoveries too, without a signal strength.
    pub fn start_scan(&mut self, mode: ScanMode) -> Result<(), SerialError> {
        if !self.adapter_state.is_powered_on() {
            warn!("Scan requested while adapter is {:?}", self.adapter_state);
            return Err(SerialError::AdapterNotReady);
        }

        let service = self.config.service_uuid;
        let filter = mode.filter(service);

        info!("Starting scan ({:?})", mode);
        self.adapter.start_scan(&filter)?;
        self.scanning = true;
        self.seen.clear();
        if self.state == ConnectionState::Idle {
            self.state = ConnectionState::Scanning;
        }

        self.adapter.retrieve_connected(&[service])
    }

    /// Stops the scan. A pending connect is left untouched.
    pub fn stop_scan(&mut self) {
        info!("Stopping scan");
        self.adapter.stop_scan();
        self.scanning = false;
        if self.state == ConnectionState::Scanning {
            self.state = ConnectionState::Idle;
        }
    }

    pub fn connect(&mut self, peripheral: Peripheral) -> Result<(), SerialError> {
        if !self.adapter_state.is_powered_on() {
            return Err(SerialError::AdapterNotReady);
        }
        if self.pending.is_some() || self.connected.is_some() {
            warn!("Connect to {} refused, a connection is already in place", peripheral.id);
            return Err(SerialError::Busy);
        }

        info!("Connecting to {} ({})", peripheral.display_name(), peripheral.id);
        self.adapter.connect(&peripheral)?;
        self.state = ConnectionState::Connecting(peripheral.id.clone());
        self.pending = Some(peripheral);
        Ok(())
    }

    /// Cancels the pending connect or drops the established link
    pub fn disconnect(&mut self) -> Result<(), SerialError> {
        let (peripheral, link) = match (self.pending.take(), self.connected.take()) {
            (Some(peripheral), _) => (peripheral, None),
            (None, Some(connection)) => (connection.peripheral, connection.link),
            (None, None) => {
                debug!("Disconnect requested with no connection in place");
                return Ok(());
            }
        };

        info!("Disconnecting from {}", peripheral.id);
        if let Some(link) = link {
            if let Err(e) = self.adapter.set_notify(&peripheral, &link.characteristic, false) {
                warn!("Failed to unsubscribe from {}: {}", peripheral.id, e);
            }
        }
        let result = self.adapter.disconnect(&peripheral);
        if result.is_ok() {
            self.closing.insert(peripheral.id.clone());
        }
        self.state = ConnectionState::Idle;
        self.emit(SerialEvent::Disconnected(peripheral));
        result
    }

    /// Writes `data` using the negotiated write mode. Writes are not queued.
    pub fn send(&mut self, data: &[u8]) -> Result<(), SerialError> {
        let connection = self.connected.as_ref().ok_or(SerialError::NotReady)?;
        let link = connection.link.ok_or(SerialError::NotReady)?;

        debug!("Writing {} bytes to {} ({:?})", data.len(), connection.peripheral.id, link.write_mode);
        self.adapter
            .write(&connection.peripheral, &link.characteristic, data, link.write_mode)
    }

    pub fn send_text(&mut self, message: &str) -> Result<(), SerialError> {
        self.send(message.as_bytes())
    }

    /// Requests the link's signal strength; the reading arrives via `on_rssi`
    pub fn read_rssi(&mut self) -> Result<(), SerialError> {
        if !self.is_ready() {
            return Err(SerialError::NotReady);
        }
        let connection = self.connected.as_ref().ok_or(SerialError::NotReady)?;
        self.adapter.read_rssi(&connection.peripheral)
    }

    /// Applies one adapter notification
    pub fn handle_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::StateChanged(state) => self.on_adapter_state(state),
            AdapterEvent::Discovered { peripheral, rssi } => self.on_discovered(peripheral, rssi),
            AdapterEvent::ConnectedPeripherals(peripherals) => {
                for peripheral in peripherals {
                    self.on_discovered(peripheral, None);
                }
            }
            AdapterEvent::Connected(id) => self.on_connected(id),
            AdapterEvent::ConnectFailed { peripheral, reason } => self.on_connect_failed(peripheral, reason),
            AdapterEvent::Disconnected { peripheral, reason } => self.on_disconnected(peripheral, reason),
            AdapterEvent::ServicesDiscovered { peripheral, result } => {
                self.on_services_discovered(peripheral, result)
            }
            AdapterEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            } => self.on_characteristics_discovered(peripheral, service, result),
            AdapterEvent::ValueUpdated {
                peripheral,
                characteristic,
                value,
            } => {
                let Some(connection) = self.connection_for(&peripheral) else {
                    return;
                };
                if connection.link.map(|link| link.characteristic.id) != Some(characteristic.id) {
                    debug!("Ignoring value from characteristic {}", characteristic.uuid);
                    return;
                }
                let peripheral = connection.peripheral.clone();
                self.emit(SerialEvent::Received { peripheral, data: value });
            }
            AdapterEvent::WriteCompleted { peripheral, result, .. } => {
                let Some(connection) = self.connection_for(&peripheral) else {
                    return;
                };
                let peripheral = connection.peripheral.clone();
                let result = result.map_err(SerialError::Adapter);
                self.emit(SerialEvent::WriteCompleted { peripheral, result });
            }
            AdapterEvent::RssiRead { peripheral, result } => {
                let Some(connection) = self.connection_for(&peripheral) else {
                    return;
                };
                let peripheral = connection.peripheral.clone();
                match result {
                    Ok(rssi) => self.emit(SerialEvent::Rssi { peripheral, rssi }),
                    Err(reason) => warn!("Failed to read RSSI of {}: {}", peripheral.id, reason),
                }
            }
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        let changed = self.adapter_state != state;
        self.adapter_state = state;

        if !state.is_powered_on() {
            // The adapter tears its own links down; only the scan is stopped here.
            if self.pending.is_some() || self.connected.is_some() {
                warn!("Adapter is {:?}, dropping connection state", state);
            }
            if self.scanning {
                self.adapter.stop_scan();
            }
            self.pending = None;
            self.connected = None;
            self.closing.clear();
            self.scanning = false;
            self.state = ConnectionState::Idle;
        }

        if changed {
            info!("Adapter state changed to {:?}", state);
            self.emit(SerialEvent::StateChanged(state));
        }
    }

    fn on_discovered(&mut self, peripheral: Peripheral, rssi: Option<i16>) {
        if !self.scanning {
            debug!("Discovery of {} outside a scan session ignored", peripheral.id);
            return;
        }
        let first_sighting = self.seen.insert(peripheral.id.clone());
        if !first_sighting && !self.config.refresh_rssi {
            return;
        }
        debug!("Discovered {} ({}), RSSI {:?}", peripheral.display_name(), peripheral.id, rssi);
        self.emit(SerialEvent::Discovered { peripheral, rssi });
    }

    fn on_connected(&mut self, id: PeripheralId) {
        let Some(peripheral) = self.pending.take_if(|pending| pending.id == id) else {
            debug!("Connection of untracked peripheral {} ignored", id);
            return;
        };

        info!("Connected to {}, discovering services...", peripheral.id);
        self.state = ConnectionState::DiscoveringServices;
        let service = self.config.service_uuid;
        let request = self.adapter.discover_services(&peripheral, &[service]);
        self.connected = Some(Connection {
            peripheral,
            outstanding: 0,
            link: None,
        });
        if let Err(e) = request {
            self.fail_connection(e);
        }
    }

    fn on_connect_failed(&mut self, id: PeripheralId, reason: String) {
        let Some(peripheral) = self.pending.take_if(|pending| pending.id == id) else {
            debug!("Connect failure of untracked peripheral {} ignored", id);
            return;
        };

        error!("Failed to connect to {}: {}", peripheral.id, reason);
        self.state = ConnectionState::Idle;
        self.emit(SerialEvent::ConnectFailed {
            peripheral,
            error: SerialError::ConnectFailed(reason),
        });
    }

    fn on_disconnected(&mut self, id: PeripheralId, reason: Option<String>) {
        if self.closing.remove(&id) {
            debug!("Disconnect of {} confirmed", id);
            return;
        }

        let peripheral = if let Some(peripheral) = self.pending.take_if(|pending| pending.id == id) {
            peripheral
        } else if let Some(connection) = self.connected.take_if(|connection| connection.peripheral.id == id) {
            connection.peripheral
        } else {
            debug!("Disconnect of untracked peripheral {} ignored", id);
            return;
        };

        info!("Disconnected from {} ({})", peripheral.id, reason.as_deref().unwrap_or("no reason"));
        self.state = ConnectionState::Idle;
        self.emit(SerialEvent::Disconnected(peripheral));
    }

    fn on_services_discovered(&mut self, id: PeripheralId, result: Result<Vec<ServiceHandle>, String>) {
        if self.state != ConnectionState::DiscoveringServices || self.connection_for(&id).is_none() {
            debug!("Unexpected service discovery result from {} ignored", id);
            return;
        }

        let services = match result {
            Ok(services) => services,
            Err(reason) => {
                self.fail_connection(SerialError::ConnectFailed(reason));
                return;
            }
        };

        let service_uuid = self.config.service_uuid;
        let characteristic_uuid = self.config.characteristic_uuid;
        let matching: Vec<_> = services.into_iter().filter(|service| service.uuid == service_uuid).collect();
        if matching.is_empty() {
            self.fail_connection(SerialError::DiscoveryIncomplete {
                peripheral: id,
                missing: MissingAttribute::Service(service_uuid),
            });
            return;
        }

        self.state = ConnectionState::DiscoveringCharacteristics;
        for service in matching {
            let Some(connection) = self.connected.as_mut() else {
                return;
            };
            debug!("Discovering characteristics of service {}", service.uuid);
            if let Err(e) = self
                .adapter
                .discover_characteristics(&connection.peripheral, &service, &[characteristic_uuid])
            {
                self.fail_connection(e);
                return;
            }
            connection.outstanding += 1;
        }
    }

    fn on_characteristics_discovered(
        &mut self,
        id: PeripheralId,
        service: ServiceHandle,
        result: Result<Vec<CharacteristicHandle>, String>,
    ) {
        if self.state != ConnectionState::DiscoveringCharacteristics {
            debug!("Characteristics of service {} ignored in state {:?}", service.uuid, self.state);
            return;
        }
        let characteristic_uuid = self.config.characteristic_uuid;
        let Some(connection) = self.connected.as_mut().filter(|connection| connection.peripheral.id == id) else {
            debug!("Characteristics from untracked peripheral {} ignored", id);
            return;
        };
        connection.outstanding = connection.outstanding.saturating_sub(1);

        let found = match result {
            Ok(characteristics) => characteristics
                .into_iter()
                .find(|characteristic| characteristic.uuid == characteristic_uuid),
            Err(reason) => {
                warn!("Characteristic discovery in service {} failed: {}", service.uuid, reason);
                None
            }
        };

        let Some(characteristic) = found else {
            if connection.outstanding == 0 {
                self.fail_connection(SerialError::DiscoveryIncomplete {
                    peripheral: id,
                    missing: MissingAttribute::Characteristic(characteristic_uuid),
                });
            }
            return;
        };

        if let Err(e) = self.adapter.set_notify(&connection.peripheral, &characteristic, true) {
            self.fail_connection(e);
            return;
        }
        let write_mode = WriteMode::for_properties(&characteristic.properties);
        connection.link = Some(SerialLink {
            characteristic,
            write_mode,
        });
        let peripheral = connection.peripheral.clone();
        self.state = ConnectionState::Ready;

        info!("Serial link to {} ready ({:?})", peripheral.id, write_mode);
        self.emit(SerialEvent::Ready(peripheral));
    }

    /// Abandons the current connection after a failed discovery step
    fn fail_connection(&mut self, error: SerialError) {
        let Some(connection) = self.connected.take() else {
            return;
        };
        let peripheral = connection.peripheral;

        error!("Connection to {} failed: {}", peripheral.id, error);
        match self.adapter.disconnect(&peripheral) {
            Ok(()) => {
                self.closing.insert(peripheral.id.clone());
            }
            Err(e) => warn!("Failed to disconnect {}: {}", peripheral.id, e),
        }
        self.state = ConnectionState::Idle;
        self.emit(SerialEvent::ConnectFailed { peripheral, error });
    }

    fn connection_for(&self, id: &PeripheralId) -> Option<&Connection> {
        let connection = self.connected.as_ref()?;
        if &connection.peripheral.id == id {
            Some(connection)
        } else {
            debug!("Event from untracked peripheral {} ignored", id);
            None
        }
    }

    fn emit(&mut self, event: SerialEvent) {
        if let Some(delegate) = self.delegate.as_mut() {
            event.dispatch(delegate.as_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::core::serial::adapter::testing::{Command, RecordingAdapter};
    use crate::core::serial::constants::{UUID_SERIAL_CHARACTERISTIC, UUID_SERIAL_SERVICE};
    use crate::core::serial::delegate::ChannelDelegate;
    use crate::core::serial::discovery::DiscoveryList;
    use crate::core::serial::types::CharacteristicProperties;

    const OTHER_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

    struct Harness {
        serial: BluetoothSerial<RecordingAdapter>,
        adapter: RecordingAdapter,
        events: mpsc::UnboundedReceiver<SerialEvent>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(SerialConfig::default())
        }

        fn with_config(config: SerialConfig) -> Self {
            let adapter = RecordingAdapter::powered_on();
            let mut serial = BluetoothSerial::new(adapter.clone(), config);
            let (delegate, events) = ChannelDelegate::new();
            serial.set_delegate(Some(Box::new(delegate)));
            Self { serial, adapter, events }
        }

        fn events(&mut self) -> Vec<SerialEvent> {
            let mut drained = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                drained.push(event);
            }
            drained
        }

        /// Drives `p` through connect and service discovery
        fn connect_through_services(&mut self, p: &Peripheral) {
            self.serial.connect(p.clone()).unwrap();
            self.serial.handle_event(AdapterEvent::Connected(p.id.clone()));
            self.serial.handle_event(AdapterEvent::ServicesDiscovered {
                peripheral: p.id.clone(),
                result: Ok(vec![service(1, UUID_SERIAL_SERVICE)]),
            });
        }

        /// Completes a connect that is already pending for `p`
        fn connect_ready_after_connect(&mut self, p: &Peripheral) {
            self.serial.handle_event(AdapterEvent::Connected(p.id.clone()));
            self.serial.handle_event(AdapterEvent::ServicesDiscovered {
                peripheral: p.id.clone(),
                result: Ok(vec![service(1, UUID_SERIAL_SERVICE)]),
            });
            self.serial.handle_event(AdapterEvent::CharacteristicsDiscovered {
                peripheral: p.id.clone(),
                service: service(1, UUID_SERIAL_SERVICE),
                result: Ok(vec![characteristic(11, UUID_SERIAL_CHARACTERISTIC, notify_only())]),
            });
            assert!(self.serial.is_ready());
        }

        fn connect_ready(&mut self, p: &Peripheral, properties: CharacteristicProperties) {
            self.connect_through_services(p);
            self.serial.handle_event(AdapterEvent::CharacteristicsDiscovered {
                peripheral: p.id.clone(),
                service: service(1, UUID_SERIAL_SERVICE),
                result: Ok(vec![characteristic(11, UUID_SERIAL_CHARACTERISTIC, properties)]),
            });
            assert!(self.serial.is_ready());
        }
    }

    fn peripheral(id: &str) -> Peripheral {
        Peripheral::new(id, Some("HMSoft".to_string()))
    }

    fn service(id: u64, uuid: Uuid) -> ServiceHandle {
        ServiceHandle { id, uuid }
    }

    fn characteristic(id: u64, uuid: Uuid, properties: CharacteristicProperties) -> CharacteristicHandle {
        CharacteristicHandle {
            id,
            uuid,
            service: 1,
            properties,
        }
    }

    fn notify_only() -> CharacteristicProperties {
        CharacteristicProperties {
            notify: true,
            write_without_response: true,
            ..Default::default()
        }
    }

    fn ready_count(events: &[SerialEvent]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, SerialEvent::Ready(_)))
            .count()
    }

    #[test]
    fn scan_requires_powered_adapter() {
        let adapter = RecordingAdapter::with_state(AdapterState::PoweredOff);
        let mut serial = BluetoothSerial::new(adapter.clone(), SerialConfig::default());

        assert_eq!(serial.start_scan(ScanMode::ServiceFiltered), Err(SerialError::AdapterNotReady));
        assert_eq!(serial.state(), &ConnectionState::Idle);
        assert!(adapter.commands().is_empty());
    }

    #[test]
    fn scan_mode_selects_filter_and_snapshots_connected() {
        let mut h = Harness::new();
        h.serial.start_scan(ScanMode::ServiceFiltered).unwrap();
        assert_eq!(h.serial.state(), &ConnectionState::Scanning);
        assert_eq!(
            h.adapter.commands(),
            vec![
                Command::StartScan(vec![UUID_SERIAL_SERVICE]),
                Command::RetrieveConnected(vec![UUID_SERIAL_SERVICE]),
            ]
        );

        h.adapter.clear();
        h.serial.stop_scan();
        assert_eq!(h.serial.state(), &ConnectionState::Idle);
        h.serial.start_scan(ScanMode::All).unwrap();
        assert_eq!(
            h.adapter.commands(),
            vec![
                Command::StopScan,
                Command::StartScan(vec![]),
                Command::RetrieveConnected(vec![UUID_SERIAL_SERVICE]),
            ]
        );

        h.serial
            .handle_event(AdapterEvent::ConnectedPeripherals(vec![peripheral("bonded")]));
        assert_eq!(
            h.events(),
            vec![SerialEvent::Discovered {
                peripheral: peripheral("bonded"),
                rssi: None
            }]
        );
    }

    #[test]
    fn duplicate_discoveries_are_reported_once() {
        let mut h = Harness::new();
        h.serial.start_scan(ScanMode::ServiceFiltered).unwrap();
        for (id, rssi) in [("P1", -40), ("P2", -70), ("P1", -30)] {
            h.serial.handle_event(AdapterEvent::Discovered {
                peripheral: peripheral(id),
                rssi: Some(rssi),
            });
        }

        let mut list = DiscoveryList::new();
        for event in h.events() {
            if let SerialEvent::Discovered { peripheral, rssi } = event {
                list.insert(peripheral, rssi);
            }
        }
        let records: Vec<_> = list
            .iter()
            .map(|record| (record.peripheral.id.to_string(), record.rssi))
            .collect();
        assert_eq!(
            records,
            vec![("P1".to_string(), Some(-40)), ("P2".to_string(), Some(-70))]
        );
    }

    #[test]
    fn refresh_rssi_forwards_repeated_sightings() {
        let config = SerialConfig {
            refresh_rssi: true,
            ..Default::default()
        };
        let mut h = Harness::with_config(config);
        h.serial.start_scan(ScanMode::ServiceFiltered).unwrap();
        for rssi in [-40, -30] {
            h.serial.handle_event(AdapterEvent::Discovered {
                peripheral: peripheral("P1"),
                rssi: Some(rssi),
            });
        }
        assert_eq!(h.events().len(), 2);
    }

    #[test]
    fn discoveries_after_stop_scan_are_dropped() {
        let mut h = Harness::new();
        h.serial.start_scan(ScanMode::All).unwrap();
        h.serial.stop_scan();
        h.serial.handle_event(AdapterEvent::Discovered {
            peripheral: peripheral("late"),
            rssi: Some(-50),
        });
        assert!(h.events().is_empty());
    }

    #[test]
    fn connect_failure_returns_to_idle() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.serial.connect(p1.clone()).unwrap();
        assert_eq!(h.serial.state(), &ConnectionState::Connecting(p1.id.clone()));
        assert_eq!(h.serial.pending_peripheral(), Some(&p1));

        h.serial.handle_event(AdapterEvent::ConnectFailed {
            peripheral: p1.id.clone(),
            reason: "timeout".to_string(),
        });

        assert_eq!(h.serial.state(), &ConnectionState::Idle);
        assert!(h.serial.pending_peripheral().is_none());
        assert!(h.serial.connected_peripheral().is_none());
        let events = h.events();
        assert_eq!(
            events,
            vec![SerialEvent::ConnectFailed {
                peripheral: p1,
                error: SerialError::ConnectFailed("timeout".to_string())
            }]
        );
        assert_eq!(ready_count(&events), 0);
    }

    #[test]
    fn connect_is_refused_while_busy_or_powered_off() {
        let mut h = Harness::new();
        h.serial.connect(peripheral("P1")).unwrap();
        assert_eq!(h.serial.connect(peripheral("P1")), Err(SerialError::Busy));
        assert_eq!(h.serial.connect(peripheral("P2")), Err(SerialError::Busy));

        h.serial.handle_event(AdapterEvent::StateChanged(AdapterState::PoweredOff));
        assert_eq!(h.serial.connect(peripheral("P2")), Err(SerialError::AdapterNotReady));
    }

    #[test]
    fn first_matching_characteristic_becomes_the_link() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.serial.connect(p1.clone()).unwrap();
        h.serial.handle_event(AdapterEvent::Connected(p1.id.clone()));
        assert_eq!(h.serial.state(), &ConnectionState::DiscoveringServices);
        assert!(h.serial.pending_peripheral().is_none());
        assert_eq!(h.serial.connected_peripheral(), Some(&p1));

        h.serial.handle_event(AdapterEvent::ServicesDiscovered {
            peripheral: p1.id.clone(),
            result: Ok(vec![service(1, UUID_SERIAL_SERVICE)]),
        });
        assert_eq!(h.serial.state(), &ConnectionState::DiscoveringCharacteristics);

        let c_other = characteristic(10, OTHER_UUID, CharacteristicProperties::default());
        let c1 = characteristic(11, UUID_SERIAL_CHARACTERISTIC, notify_only());
        let c2 = characteristic(
            12,
            UUID_SERIAL_CHARACTERISTIC,
            CharacteristicProperties {
                write: true,
                ..Default::default()
            },
        );
        h.serial.handle_event(AdapterEvent::CharacteristicsDiscovered {
            peripheral: p1.id.clone(),
            service: service(1, UUID_SERIAL_SERVICE),
            result: Ok(vec![c_other, c1, c2]),
        });

        assert!(h.serial.is_ready());
        assert_eq!(h.serial.link().unwrap().characteristic, c1);
        assert_eq!(h.serial.write_mode(), Some(WriteMode::WithoutResponse));
        assert_eq!(
            h.adapter.commands(),
            vec![
                Command::Connect(p1.id.clone()),
                Command::DiscoverServices(p1.id.clone(), vec![UUID_SERIAL_SERVICE]),
                Command::DiscoverCharacteristics(p1.id.clone(), 1, vec![UUID_SERIAL_CHARACTERISTIC]),
                Command::SetNotify(p1.id.clone(), 11, true),
            ]
        );
        assert_eq!(h.events(), vec![SerialEvent::Ready(p1)]);
    }

    #[test]
    fn ready_fires_once_per_connection() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.serial.connect(p1.clone()).unwrap();
        h.serial.handle_event(AdapterEvent::Connected(p1.id.clone()));
        h.serial.handle_event(AdapterEvent::ServicesDiscovered {
            peripheral: p1.id.clone(),
            result: Ok(vec![service(1, UUID_SERIAL_SERVICE), service(2, UUID_SERIAL_SERVICE)]),
        });
        for id in [1, 2] {
            h.serial.handle_event(AdapterEvent::CharacteristicsDiscovered {
                peripheral: p1.id.clone(),
                service: service(id, UUID_SERIAL_SERVICE),
                result: Ok(vec![characteristic(10 + id, UUID_SERIAL_CHARACTERISTIC, notify_only())]),
            });
        }

        assert_eq!(ready_count(&h.events()), 1);
        assert_eq!(h.serial.link().unwrap().characteristic.id, 11);
    }

    #[test]
    fn write_mode_follows_acknowledged_write_capability() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.connect_ready(
            &p1,
            CharacteristicProperties {
                write: true,
                write_without_response: true,
                notify: true,
                ..Default::default()
            },
        );
        assert_eq!(h.serial.write_mode(), Some(WriteMode::WithResponse));

        h.adapter.clear();
        h.serial.send_text("1").unwrap();
        assert_eq!(
            h.adapter.commands(),
            vec![Command::Write(p1.id.clone(), 11, b"1".to_vec(), WriteMode::WithResponse)]
        );

        let link = h.serial.link().unwrap().characteristic;
        h.serial.handle_event(AdapterEvent::WriteCompleted {
            peripheral: p1.id.clone(),
            characteristic: link,
            result: Err("write not permitted".to_string()),
        });
        let events = h.events();
        assert_eq!(
            events.last(),
            Some(&SerialEvent::WriteCompleted {
                peripheral: p1,
                result: Err(SerialError::Adapter("write not permitted".to_string()))
            })
        );
    }

    #[test]
    fn send_outside_ready_is_rejected() {
        let mut h = Harness::new();
        assert_eq!(h.serial.send(b"1"), Err(SerialError::NotReady));
        h.connect_through_services(&peripheral("P1"));
        assert_eq!(h.serial.send(b"1"), Err(SerialError::NotReady));
        assert_eq!(h.serial.read_rssi(), Err(SerialError::NotReady));
    }

    #[test]
    fn ready_requires_discovery_for_the_same_peripheral() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.serial.connect(p1.clone()).unwrap();
        // Results for another peripheral never advance the machine
        h.serial.handle_event(AdapterEvent::Connected(PeripheralId::new("P2")));
        assert_eq!(h.serial.state(), &ConnectionState::Connecting(p1.id.clone()));

        h.serial.handle_event(AdapterEvent::Connected(p1.id.clone()));
        h.serial.handle_event(AdapterEvent::ServicesDiscovered {
            peripheral: PeripheralId::new("P2"),
            result: Ok(vec![service(1, UUID_SERIAL_SERVICE)]),
        });
        assert_eq!(h.serial.state(), &ConnectionState::DiscoveringServices);

        // Characteristics before services were discovered are ignored
        h.serial.handle_event(AdapterEvent::CharacteristicsDiscovered {
            peripheral: p1.id.clone(),
            service: service(1, UUID_SERIAL_SERVICE),
            result: Ok(vec![characteristic(11, UUID_SERIAL_CHARACTERISTIC, notify_only())]),
        });
        assert!(!h.serial.is_ready());
        assert_eq!(ready_count(&h.events()), 0);
    }

    #[test]
    fn missing_service_reports_discovery_incomplete() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.serial.connect(p1.clone()).unwrap();
        h.serial.handle_event(AdapterEvent::Connected(p1.id.clone()));
        h.serial.handle_event(AdapterEvent::ServicesDiscovered {
            peripheral: p1.id.clone(),
            result: Ok(vec![]),
        });

        assert_eq!(h.serial.state(), &ConnectionState::Idle);
        assert!(h.serial.connected_peripheral().is_none());
        assert_eq!(h.adapter.commands().last(), Some(&Command::Disconnect(p1.id.clone())));
        assert_eq!(
            h.events(),
            vec![SerialEvent::ConnectFailed {
                peripheral: p1.clone(),
                error: SerialError::DiscoveryIncomplete {
                    peripheral: p1.id,
                    missing: MissingAttribute::Service(UUID_SERIAL_SERVICE),
                }
            }]
        );
    }

    #[test]
    fn missing_characteristic_waits_for_every_service() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.serial.connect(p1.clone()).unwrap();
        h.serial.handle_event(AdapterEvent::Connected(p1.id.clone()));
        h.serial.handle_event(AdapterEvent::ServicesDiscovered {
            peripheral: p1.id.clone(),
            result: Ok(vec![service(1, UUID_SERIAL_SERVICE), service(2, UUID_SERIAL_SERVICE)]),
        });

        h.serial.handle_event(AdapterEvent::CharacteristicsDiscovered {
            peripheral: p1.id.clone(),
            service: service(1, UUID_SERIAL_SERVICE),
            result: Ok(vec![characteristic(10, OTHER_UUID, notify_only())]),
        });
        assert_eq!(h.serial.state(), &ConnectionState::DiscoveringCharacteristics);
        assert!(h.events().is_empty());

        h.serial.handle_event(AdapterEvent::CharacteristicsDiscovered {
            peripheral: p1.id.clone(),
            service: service(2, UUID_SERIAL_SERVICE),
            result: Err("attribute not found".to_string()),
        });
        assert_eq!(h.serial.state(), &ConnectionState::Idle);
        assert_eq!(
            h.events(),
            vec![SerialEvent::ConnectFailed {
                peripheral: p1.clone(),
                error: SerialError::DiscoveryIncomplete {
                    peripheral: p1.id,
                    missing: MissingAttribute::Characteristic(UUID_SERIAL_CHARACTERISTIC),
                }
            }]
        );
    }

    #[test]
    fn power_off_clears_everything_idempotently() {
        let mut h = Harness::new();
        h.serial.start_scan(ScanMode::ServiceFiltered).unwrap();
        h.connect_ready(&peripheral("P1"), notify_only());
        h.events();
        h.adapter.clear();

        for _ in 0..2 {
            h.serial.handle_event(AdapterEvent::StateChanged(AdapterState::PoweredOff));
            assert_eq!(h.serial.state(), &ConnectionState::Idle);
            assert!(h.serial.pending_peripheral().is_none());
            assert!(h.serial.connected_peripheral().is_none());
            assert!(h.serial.link().is_none());
            assert!(!h.serial.is_scanning());
        }

        // Only the running scan is stopped; links are left to the adapter
        assert_eq!(h.adapter.commands(), vec![Command::StopScan]);
        assert_eq!(h.events(), vec![SerialEvent::StateChanged(AdapterState::PoweredOff)]);
    }

    #[test]
    fn power_off_during_connect_and_discovery() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.serial.connect(p1.clone()).unwrap();
        h.serial.handle_event(AdapterEvent::StateChanged(AdapterState::Resetting));
        assert_eq!(h.serial.state(), &ConnectionState::Idle);
        assert!(h.serial.pending_peripheral().is_none());

        h.serial.handle_event(AdapterEvent::StateChanged(AdapterState::PoweredOn));
        h.connect_through_services(&p1);
        h.serial.handle_event(AdapterEvent::StateChanged(AdapterState::PoweredOff));
        assert_eq!(h.serial.state(), &ConnectionState::Idle);
        assert!(h.serial.connected_peripheral().is_none());

        // A late discovery result after the power loss changes nothing
        h.serial.handle_event(AdapterEvent::CharacteristicsDiscovered {
            peripheral: p1.id.clone(),
            service: service(1, UUID_SERIAL_SERVICE),
            result: Ok(vec![characteristic(11, UUID_SERIAL_CHARACTERISTIC, notify_only())]),
        });
        assert_eq!(ready_count(&h.events()), 0);
    }

    #[test]
    fn stop_scan_keeps_pending_connect() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.serial.start_scan(ScanMode::ServiceFiltered).unwrap();
        h.serial.connect(p1.clone()).unwrap();
        h.serial.stop_scan();

        assert_eq!(h.serial.state(), &ConnectionState::Connecting(p1.id.clone()));
        assert_eq!(h.serial.pending_peripheral(), Some(&p1));
    }

    #[test]
    fn peripheral_disconnect_returns_to_idle() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.connect_ready(&p1, notify_only());
        h.events();

        h.serial.handle_event(AdapterEvent::Disconnected {
            peripheral: p1.id.clone(),
            reason: Some("peripheral disconnected".to_string()),
        });
        assert_eq!(h.serial.state(), &ConnectionState::Idle);
        assert_eq!(h.events(), vec![SerialEvent::Disconnected(p1.clone())]);

        // Reconnecting is possible right away
        h.serial.connect(p1).unwrap();
    }

    #[test]
    fn disconnect_command_unsubscribes_and_reports_once() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.connect_ready(&p1, notify_only());
        h.events();
        h.adapter.clear();

        h.serial.disconnect().unwrap();
        assert_eq!(
            h.adapter.commands(),
            vec![
                Command::SetNotify(p1.id.clone(), 11, false),
                Command::Disconnect(p1.id.clone()),
            ]
        );

        // The adapter's own confirmation is not reported a second time
        h.serial.handle_event(AdapterEvent::Disconnected {
            peripheral: p1.id.clone(),
            reason: None,
        });
        assert_eq!(h.events(), vec![SerialEvent::Disconnected(p1)]);
        assert_eq!(h.serial.disconnect(), Ok(()));
    }

    #[test]
    fn notifications_and_rssi_reach_the_delegate() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.connect_ready(&p1, notify_only());
        h.events();
        let link = h.serial.link().unwrap().characteristic;

        h.serial.handle_event(AdapterEvent::ValueUpdated {
            peripheral: p1.id.clone(),
            characteristic: link,
            value: b"2".to_vec(),
        });
        h.serial.handle_event(AdapterEvent::ValueUpdated {
            peripheral: p1.id.clone(),
            characteristic: characteristic(99, OTHER_UUID, notify_only()),
            value: b"noise".to_vec(),
        });
        h.serial.read_rssi().unwrap();
        h.serial.handle_event(AdapterEvent::RssiRead {
            peripheral: p1.id.clone(),
            result: Ok(-61),
        });

        assert_eq!(h.adapter.commands().last(), Some(&Command::ReadRssi(p1.id.clone())));
        assert_eq!(
            h.events(),
            vec![
                SerialEvent::Received {
                    peripheral: p1.clone(),
                    data: b"2".to_vec()
                },
                SerialEvent::Rssi { peripheral: p1, rssi: -61 },
            ]
        );
    }

    #[test]
    fn reconnect_survives_late_disconnect_confirmation() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.connect_ready(&p1, notify_only());
        h.serial.disconnect().unwrap();
        h.serial.connect(p1.clone()).unwrap();
        h.events();

        // Confirmation of the earlier disconnect arrives after the new connect
        h.serial.handle_event(AdapterEvent::Disconnected {
            peripheral: p1.id.clone(),
            reason: None,
        });
        assert_eq!(h.serial.state(), &ConnectionState::Connecting(p1.id.clone()));
        assert_eq!(h.serial.pending_peripheral(), Some(&p1));
        assert!(h.events().is_empty());

        h.serial.handle_event(AdapterEvent::Connected(p1.id.clone()));
        assert_eq!(h.serial.state(), &ConnectionState::DiscoveringServices);
        assert_eq!(h.serial.connected_peripheral(), Some(&p1));

        // A disconnect the peripheral starts is still reported
        h.serial.handle_event(AdapterEvent::Disconnected {
            peripheral: p1.id.clone(),
            reason: Some("link lost".to_string()),
        });
        assert_eq!(h.serial.state(), &ConnectionState::Idle);
        assert_eq!(h.events(), vec![SerialEvent::Disconnected(p1)]);
    }

    #[test]
    fn retry_after_discovery_failure_is_not_cancelled() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.serial.connect(p1.clone()).unwrap();
        h.serial.handle_event(AdapterEvent::Connected(p1.id.clone()));
        h.serial.handle_event(AdapterEvent::ServicesDiscovered {
            peripheral: p1.id.clone(),
            result: Ok(vec![]),
        });
        assert_eq!(h.serial.state(), &ConnectionState::Idle);

        h.serial.connect(p1.clone()).unwrap();
        h.serial.handle_event(AdapterEvent::Disconnected {
            peripheral: p1.id.clone(),
            reason: None,
        });
        assert_eq!(h.serial.state(), &ConnectionState::Connecting(p1.id.clone()));

        h.events();
        h.connect_ready_after_connect(&p1);
        assert_eq!(h.events(), vec![SerialEvent::Ready(p1)]);
    }

    fn assert_failed_without_ready(h: &mut Harness, p: &Peripheral) {
        assert_eq!(h.serial.state(), &ConnectionState::Idle);
        assert!(h.serial.pending_peripheral().is_none());
        assert!(h.serial.connected_peripheral().is_none());
        assert_eq!(h.adapter.commands().last(), Some(&Command::Disconnect(p.id.clone())));
        assert_eq!(
            h.events(),
            vec![SerialEvent::ConnectFailed {
                peripheral: p.clone(),
                error: SerialError::Adapter("rejected by test adapter".to_string())
            }]
        );
    }

    #[test]
    fn rejected_service_discovery_fails_the_connection() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.adapter.fail_next(|command| matches!(command, Command::DiscoverServices(..)));

        h.serial.connect(p1.clone()).unwrap();
        h.serial.handle_event(AdapterEvent::Connected(p1.id.clone()));
        assert_failed_without_ready(&mut h, &p1);
    }

    #[test]
    fn rejected_characteristic_discovery_fails_the_connection() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.adapter.fail_next(|command| matches!(command, Command::DiscoverCharacteristics(..)));

        h.connect_through_services(&p1);
        assert_failed_without_ready(&mut h, &p1);
    }

    #[test]
    fn rejected_subscription_fails_the_connection() {
        let mut h = Harness::new();
        let p1 = peripheral("P1");
        h.adapter.fail_next(|command| matches!(command, Command::SetNotify(_, _, true)));

        h.connect_through_services(&p1);
        h.serial.handle_event(AdapterEvent::CharacteristicsDiscovered {
            peripheral: p1.id.clone(),
            service: service(1, UUID_SERIAL_SERVICE),
            result: Ok(vec![characteristic(11, UUID_SERIAL_CHARACTERISTIC, notify_only())]),
        });
        assert!(h.serial.link().is_none());
        assert_failed_without_ready(&mut h, &p1);
    }
}
