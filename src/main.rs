//! Console front-end: scan, connect to the strongest module, then relay
//! stdin lines to it and print whatever it sends back.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn, LevelFilter};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

use hm10_serial_lib::core::serial::{DEFAULT_READY_TIMEOUT_SECS, DEFAULT_SCAN_DURATION_SECS};
use hm10_serial_lib::utils::describe_payload;
use hm10_serial_lib::{
    logging, AdapterState, BluestAdapter, BluetoothSerial, ChannelDelegate, DiscoveryList, Peripheral,
    SerialConfig, SerialError, SerialEvent, SerialSession, SessionHandle,
};

/// Path of an optional JSON config file
const CONFIG_PATH_ENV: &str = "HM10_SERIAL_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(LevelFilter::Info);

    let config = match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) => SerialConfig::load_config(path).await?,
        None => SerialConfig::default(),
    };

    let (adapter, adapter_events) = BluestAdapter::new().await?;
    let mut serial = BluetoothSerial::new(adapter, config.clone());
    let (delegate, mut events) = ChannelDelegate::new();
    serial.set_delegate(Some(Box::new(delegate)));

    let mut session = SerialSession::spawn(serial, adapter_events);
    let handle = session.handle();

    let result = run(&handle, &mut events, &config).await;

    if let Err(e) = handle.disconnect().await {
        warn!("Failed to disconnect: {}", e);
    }
    session.shutdown().await;
    result
}

async fn run(handle: &SessionHandle, events: &mut UnboundedReceiver<SerialEvent>, config: &SerialConfig) -> Result<()> {
    start_scan(handle, events, config).await?;
    let discoveries = collect_discoveries(events, config).await?;
    handle.stop_scan().await?;

    println!("Found {} peripheral(s):", discoveries.len());
    for record in discoveries.sorted() {
        // Already-connected peripherals come from a snapshot without a reading
        let rssi = record.rssi.map_or_else(|| "-".to_string(), |rssi| rssi.to_string());
        println!("  {:>5} dBm  {}  ({})", rssi, record.peripheral.display_name(), record.peripheral.id);
    }

    let target = discoveries
        .strongest()
        .map(|record| record.peripheral.clone())
        .ok_or_else(|| anyhow!("No serial peripheral found"))?;

    handle.connect(target.clone()).await?;
    let ready = match timeout(Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS), wait_ready(events)).await {
        Ok(ready) => ready?,
        Err(_) => bail!("Timed out waiting for {} to become ready", target.display_name()),
    };
    println!("Connected to {}. Type a line to send it, Ctrl-D to quit.", ready.display_name());

    relay(handle, events).await
}

/// Starts the scan, waiting for the radio to power on if needed
async fn start_scan(handle: &SessionHandle, events: &mut UnboundedReceiver<SerialEvent>, config: &SerialConfig) -> Result<()> {
    loop {
        match handle.start_scan(config.scan_mode).await {
            Ok(()) => return Ok(()),
            Err(SerialError::AdapterNotReady) => {
                info!("Waiting for the Bluetooth adapter to power on...");
                loop {
                    match events.recv().await {
                        Some(SerialEvent::StateChanged(AdapterState::PoweredOn)) => break,
                        Some(event) => debug!("Ignoring {:?} while powered off", event),
                        None => bail!("Serial session ended"),
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn collect_discoveries(
    events: &mut UnboundedReceiver<SerialEvent>,
    config: &SerialConfig,
) -> Result<DiscoveryList> {
    let mut discoveries = DiscoveryList::with_rssi_refresh(config.refresh_rssi);
    let deadline = sleep(Duration::from_secs(DEFAULT_SCAN_DURATION_SECS));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => {
                match event {
                    Some(SerialEvent::Discovered { peripheral, rssi }) => {
                        if discoveries.insert(peripheral.clone(), rssi) {
                            info!("Found {} ({:?} dBm)", peripheral.display_name(), rssi);
                        }
                    }
                    Some(event) => debug!("Ignoring {:?} while scanning", event),
                    None => bail!("Serial session ended"),
                }
            }
        }
    }
    Ok(discoveries)
}

async fn wait_ready(events: &mut UnboundedReceiver<SerialEvent>) -> Result<Peripheral> {
    while let Some(event) = events.recv().await {
        match event {
            SerialEvent::Ready(peripheral) => return Ok(peripheral),
            SerialEvent::ConnectFailed { error, .. } => return Err(error.into()),
            SerialEvent::StateChanged(state) if !state.is_powered_on() => {
                return Err(SerialError::AdapterNotReady.into());
            }
            other => debug!("Ignoring {:?} while connecting", other),
        }
    }
    bail!("Serial session ended")
}

/// Sends stdin lines and prints received data until EOF or disconnect
async fn relay(handle: &SessionHandle, events: &mut UnboundedReceiver<SerialEvent>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if let Err(e) = handle.send_text(&line).await {
                            warn!("Failed to send {:?}: {}", line, e);
                        }
                    }
                    None => return Ok(()),
                }
            }
            event = events.recv() => {
                match event {
                    Some(SerialEvent::Received { data, .. }) => println!("< {}", describe_payload(&data)),
                    Some(SerialEvent::WriteCompleted { result: Err(e), .. }) => warn!("Write failed: {}", e),
                    Some(SerialEvent::Disconnected(peripheral)) => {
                        println!("Disconnected from {}", peripheral.display_name());
                        return Ok(());
                    }
                    Some(SerialEvent::StateChanged(state)) if !state.is_powered_on() => {
                        bail!("Bluetooth adapter is {:?}", state);
                    }
                    Some(event) => debug!("Serial event: {:?}", event),
                    None => bail!("Serial session ended"),
                }
            }
        }
    }
}
