//! `Adapter` implementation on top of the `bluest` crate.
//! Every command spawns a tokio task that performs the async bluest call and
//! reports the outcome as an `AdapterEvent` on the session channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use bluest::{Characteristic, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::serial::adapter::{Adapter, AdapterEvent};
use crate::core::serial::error::SerialError;
use crate::core::serial::types::{
    AdapterState, CharacteristicHandle, CharacteristicProperties, Peripheral, PeripheralId,
    ServiceHandle, WriteMode,
};

/// Objects handed out by numeric handle, grouped by the peripheral they belong to
struct HandleTable<T> {
    entries: HashMap<u64, (PeripheralId, T)>,
    next_handle: u64,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_handle: 0,
        }
    }
}

impl<T: Clone> HandleTable<T> {
    fn insert(&mut self, owner: &PeripheralId, value: T) -> u64 {
        self.next_handle += 1;
        self.entries.insert(self.next_handle, (owner.clone(), value));
        self.next_handle
    }

    fn get(&self, handle: u64) -> Option<T> {
        self.entries.get(&handle).map(|(_, value)| value.clone())
    }

    /// Drops every entry owned by `owner`
    fn release(&mut self, owner: &PeripheralId) {
        self.entries.retain(|_, (entry_owner, _)| entry_owner != owner);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// bluest objects the state machine refers to by handle
#[derive(Default)]
struct Registry {
    devices: HashMap<PeripheralId, Device>,
    services: HandleTable<Service>,
    characteristics: HandleTable<Characteristic>,
}

impl Registry {
    fn add_device(&mut self, device: Device) -> Peripheral {
        let peripheral = to_peripheral(&device);
        self.devices.insert(peripheral.id.clone(), device);
        peripheral
    }

    fn add_service(&mut self, owner: &PeripheralId, service: Service) -> ServiceHandle {
        let uuid = service.uuid();
        ServiceHandle {
            id: self.services.insert(owner, service),
            uuid,
        }
    }

    fn add_characteristic(
        &mut self,
        owner: &PeripheralId,
        service: u64,
        characteristic: Characteristic,
        properties: CharacteristicProperties,
    ) -> CharacteristicHandle {
        let uuid = characteristic.uuid();
        CharacteristicHandle {
            id: self.characteristics.insert(owner, characteristic),
            uuid,
            service,
            properties,
        }
    }

    /// Forgets the GATT handles of a peripheral; the device stays known for reconnects
    fn release(&mut self, owner: &PeripheralId) {
        self.services.release(owner);
        self.characteristics.release(owner);
        debug!(
            "Released handles of {}, {} services and {} characteristics remain",
            owner,
            self.services.len(),
            self.characteristics.len()
        );
    }
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BluestAdapter {
    adapter: bluest::Adapter,
    events: mpsc::UnboundedSender<AdapterEvent>,
    state: Arc<Mutex<AdapterState>>,
    registry: SharedRegistry,
    scan_cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
    /// Notification stream tasks keyed by characteristic handle
    notify_tokens: HashMap<u64, CancellationToken>,
    power_task_handle: JoinHandle<()>,
}

impl BluestAdapter {
    /// Opens the default adapter. The receiver must be handed to the session.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<AdapterEvent>)> {
        let adapter = bluest::Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        let initial_state = if adapter.is_available().await? {
            AdapterState::PoweredOn
        } else {
            AdapterState::PoweredOff
        };
        info!("Bluetooth adapter found, state {:?}", initial_state);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(initial_state));
        let power_task_handle = tokio::spawn(Self::watch_power(
            adapter.clone(),
            state.clone(),
            events_tx.clone(),
        ));

        Ok((
            Self {
                adapter,
                events: events_tx,
                state,
                registry: Arc::new(Mutex::new(Registry::default())),
                scan_cancel_token: CancellationToken::new(),
                scan_task_handle: None,
                notify_tokens: HashMap::new(),
                power_task_handle,
            },
            events_rx,
        ))
    }

    /// Forwards adapter availability changes as power-state events
    async fn watch_power(
        adapter: bluest::Adapter,
        state: Arc<Mutex<AdapterState>>,
        events: mpsc::UnboundedSender<AdapterEvent>,
    ) {
        let mut stream = match adapter.events().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to subscribe to adapter events: {}", e);
                return;
            }
        };

        while let Some(event) = stream.next().await {
            let new_state = match event {
                Ok(bluest::AdapterEvent::Available) => AdapterState::PoweredOn,
                Ok(bluest::AdapterEvent::Unavailable) => AdapterState::PoweredOff,
                Err(e) => {
                    error!("Error in adapter event stream: {}", e);
                    break;
                }
            };
            *state.lock().unwrap_or_else(PoisonError::into_inner) = new_state;
            if events.send(AdapterEvent::StateChanged(new_state)).is_err() {
                break;
            }
        }
        info!("Adapter event stream ended");
    }

    fn device(&self, peripheral: &Peripheral) -> Result<Device, SerialError> {
        lock(&self.registry)
            .devices
            .get(&peripheral.id)
            .cloned()
            .ok_or_else(|| SerialError::Adapter(format!("unknown peripheral {}", peripheral.id)))
    }

    fn characteristic(&self, handle: &CharacteristicHandle) -> Result<Characteristic, SerialError> {
        lock(&self.registry)
            .characteristics
            .get(handle.id)
            .ok_or_else(|| SerialError::Adapter(format!("unknown characteristic {}", handle.uuid)))
    }

    /// Scans until cancelled, registering every advertising device
    async fn scan_task(
        adapter: bluest::Adapter,
        services: Vec<Uuid>,
        registry: SharedRegistry,
        events: mpsc::UnboundedSender<AdapterEvent>,
        cancel_token: CancellationToken,
    ) {
        let mut scan_stream = match adapter.scan(&services).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start bluetooth scan: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered_device) => {
                            debug!("Found device - Device: {:?}, RSSI: {:?}", discovered_device.device, discovered_device.rssi);
                            let peripheral = lock(&registry).add_device(discovered_device.device);
                            let event = AdapterEvent::Discovered {
                                peripheral,
                                rssi: discovered_device.rssi,
                            };
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    }

    /// Relays notifications until cancelled or the stream ends
    async fn notification_task(
        device: Device,
        characteristic: Characteristic,
        handle: CharacteristicHandle,
        peripheral: PeripheralId,
        events: mpsc::UnboundedSender<AdapterEvent>,
        cancel_token: CancellationToken,
    ) {
        info!("Listening for notifications on {}...", handle.uuid);
        match characteristic.notify().await {
            Ok(mut notification_stream) => loop {
                tokio::select! {
                    result = notification_stream.next() => {
                        match result {
                            Some(Ok(value)) => {
                                debug!("Received serial data: {:?}", value);
                                let event = AdapterEvent::ValueUpdated {
                                    peripheral: peripheral.clone(),
                                    characteristic: handle,
                                    value,
                                };
                                if events.send(event).is_err() {
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                error!("Error in notification stream: {}", e);
                                break;
                            }
                            None => break,
                        }
                    }
                    _ = cancel_token.cancelled() => {
                        info!("Notifications on {} cancelled", handle.uuid);
                        return;
                    }
                }
            },
            Err(e) => {
                error!("Failed to subscribe to notifications: {}", e);
                return;
            }
        }

        info!("Notification stream ended");
        if !device.is_connected().await {
            let _ = events.send(AdapterEvent::Disconnected {
                peripheral,
                reason: Some("notification stream ended".to_string()),
            });
        }
    }
}

impl Drop for BluestAdapter {
    fn drop(&mut self) {
        self.scan_cancel_token.cancel();
        for token in self.notify_tokens.values() {
            token.cancel();
        }
        self.power_task_handle.abort();
    }
}

impl Adapter for BluestAdapter {
    fn state(&self) -> AdapterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_scan(&mut self, services: &[Uuid]) -> Result<(), SerialError> {
        self.stop_scan();

        self.scan_cancel_token = CancellationToken::new();
        let handle = tokio::spawn(Self::scan_task(
            self.adapter.clone(),
            services.to_vec(),
            self.registry.clone(),
            self.events.clone(),
            self.scan_cancel_token.clone(),
        ));
        self.scan_task_handle = Some(handle);
        info!("Device scan task started.");
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.scan_cancel_token.cancel();
        if self.scan_task_handle.take().is_some() {
            info!("Device scan task stopped.");
        }
    }

    fn retrieve_connected(&mut self, services: &[Uuid]) -> Result<(), SerialError> {
        let adapter = self.adapter.clone();
        let services = services.to_vec();
        let registry = self.registry.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            match adapter.connected_devices_with_services(&services).await {
                Ok(devices) => {
                    let peripherals = {
                        let mut registry = lock(&registry);
                        devices.into_iter().map(|device| registry.add_device(device)).collect()
                    };
                    let _ = events.send(AdapterEvent::ConnectedPeripherals(peripherals));
                }
                Err(e) => warn!("Failed to list connected devices: {}", e),
            }
        });
        Ok(())
    }

    fn connect(&mut self, peripheral: &Peripheral) -> Result<(), SerialError> {
        let device = self.device(peripheral)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let id = peripheral.id.clone();

        tokio::spawn(async move {
            info!("Initiating connection to {}...", id);
            let event = match adapter.connect_device(&device).await {
                Ok(()) => AdapterEvent::Connected(id),
                Err(e) => AdapterEvent::ConnectFailed {
                    peripheral: id,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn disconnect(&mut self, peripheral: &Peripheral) -> Result<(), SerialError> {
        let device = self.device(peripheral)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let id = peripheral.id.clone();

        for (_, token) in self.notify_tokens.drain() {
            token.cancel();
        }
        lock(&self.registry).release(&id);

        tokio::spawn(async move {
            info!("Disconnecting from device {}", id);
            let reason = match adapter.disconnect_device(&device).await {
                Ok(()) => None,
                Err(e) => {
                    error!("Failed to disconnect {}: {}", id, e);
                    Some(e.to_string())
                }
            };
            let _ = events.send(AdapterEvent::Disconnected { peripheral: id, reason });
        });
        Ok(())
    }

    fn discover_services(&mut self, peripheral: &Peripheral, services: &[Uuid]) -> Result<(), SerialError> {
        let device = self.device(peripheral)?;
        let registry = self.registry.clone();
        let events = self.events.clone();
        let services = services.to_vec();
        let id = peripheral.id.clone();

        tokio::spawn(async move {
            let mut found = Vec::new();
            let mut failure = None;
            if services.is_empty() {
                match device.discover_services().await {
                    Ok(list) => found.extend(list),
                    Err(e) => failure = Some(e.to_string()),
                }
            }
            for uuid in services {
                match device.discover_services_with_uuid(uuid).await {
                    Ok(list) => found.extend(list),
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }

            let result = match failure {
                Some(reason) => Err(reason),
                None => {
                    let mut registry = lock(&registry);
                    Ok(found
                        .into_iter()
                        .map(|service| registry.add_service(&id, service))
                        .collect())
                }
            };
            let _ = events.send(AdapterEvent::ServicesDiscovered { peripheral: id, result });
        });
        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        peripheral: &Peripheral,
        service: &ServiceHandle,
        characteristics: &[Uuid],
    ) -> Result<(), SerialError> {
        let bluest_service = lock(&self.registry)
            .services
            .get(service.id)
            .ok_or_else(|| SerialError::Adapter(format!("unknown service {}", service.uuid)))?;
        let registry = self.registry.clone();
        let events = self.events.clone();
        let characteristics = characteristics.to_vec();
        let service = *service;
        let id = peripheral.id.clone();

        tokio::spawn(async move {
            let result = discover_characteristics(&bluest_service, &characteristics).await;
            let result = match result {
                Ok(found) => {
                    let mut registry = lock(&registry);
                    Ok(found
                        .into_iter()
                        .map(|(characteristic, properties)| {
                            registry.add_characteristic(&id, service.id, characteristic, properties)
                        })
                        .collect())
                }
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(AdapterEvent::CharacteristicsDiscovered {
                peripheral: id,
                service,
                result,
            });
        });
        Ok(())
    }

    fn set_notify(
        &mut self,
        peripheral: &Peripheral,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), SerialError> {
        if let Some(token) = self.notify_tokens.remove(&characteristic.id) {
            token.cancel();
        }
        if !enabled {
            return Ok(());
        }

        let device = self.device(peripheral)?;
        let bluest_characteristic = self.characteristic(characteristic)?;
        let cancel_token = CancellationToken::new();
        self.notify_tokens.insert(characteristic.id, cancel_token.clone());

        tokio::spawn(Self::notification_task(
            device,
            bluest_characteristic,
            *characteristic,
            peripheral.id.clone(),
            self.events.clone(),
            cancel_token,
        ));
        Ok(())
    }

    fn write(
        &mut self,
        peripheral: &Peripheral,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), SerialError> {
        let bluest_characteristic = self.characteristic(characteristic)?;
        let events = self.events.clone();
        let handle = *characteristic;
        let id = peripheral.id.clone();
        let data = data.to_vec();

        tokio::spawn(async move {
            match mode {
                WriteMode::WithResponse => {
                    let result = bluest_characteristic.write(&data).await.map_err(|e| e.to_string());
                    let _ = events.send(AdapterEvent::WriteCompleted {
                        peripheral: id,
                        characteristic: handle,
                        result,
                    });
                }
                WriteMode::WithoutResponse => {
                    if let Err(e) = bluest_characteristic.write_without_response(&data).await {
                        error!("Failed to write to {}: {}", handle.uuid, e);
                    }
                }
            }
        });
        Ok(())
    }

    fn read_rssi(&mut self, peripheral: &Peripheral) -> Result<(), SerialError> {
        let device = self.device(peripheral)?;
        let events = self.events.clone();
        let id = peripheral.id.clone();

        tokio::spawn(async move {
            let result = device.rssi().await.map_err(|e| e.to_string());
            let _ = events.send(AdapterEvent::RssiRead { peripheral: id, result });
        });
        Ok(())
    }
}

async fn discover_characteristics(
    service: &Service,
    uuids: &[Uuid],
) -> Result<Vec<(Characteristic, CharacteristicProperties)>> {
    let mut found = Vec::new();
    if uuids.is_empty() {
        found.extend(service.discover_characteristics().await?);
    }
    for uuid in uuids {
        found.extend(service.discover_characteristics_with_uuid(*uuid).await?);
    }

    let mut described = Vec::with_capacity(found.len());
    for characteristic in found {
        let properties = match characteristic.properties().await {
            Ok(properties) => CharacteristicProperties {
                read: properties.read,
                write: properties.write,
                write_without_response: properties.write_without_response,
                notify: properties.notify,
                indicate: properties.indicate,
            },
            Err(e) => {
                warn!("Failed to read properties of {}: {}", characteristic.uuid(), e);
                CharacteristicProperties::default()
            }
        };
        described.push((characteristic, properties));
    }
    Ok(described)
}

fn to_peripheral(device: &Device) -> Peripheral {
    let id = device.id().to_string();
    let address = extract_mac_address(&id);
    Peripheral::new(id, device.name().ok()).with_address(address)
}

fn extract_mac_address(device_id_str: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
    re.find_iter(device_id_str).last().map(|m| m.as_str().to_uppercase())
}
