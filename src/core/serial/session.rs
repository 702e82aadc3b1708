//! Serialized event loop around the state machine.
//!
//! The session task is the only owner of the `BluetoothSerial`. Adapter events
//! and caller commands are merged into one loop and applied one at a time, so
//! the machine never sees two notifications concurrently.

use log::{debug, error, info};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::serial::adapter::{Adapter, AdapterEvent};
use crate::core::serial::constants::SESSION_COMMAND_CAPACITY;
use crate::core::serial::error::SerialError;
use crate::core::serial::machine::BluetoothSerial;
use crate::core::serial::types::{AdapterState, ConnectionState, Peripheral, ScanMode, WriteMode};

/// Snapshot of the machine, as seen from outside the session task
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub adapter_state: AdapterState,
    pub scanning: bool,
    pub pending: Option<Peripheral>,
    pub connected: Option<Peripheral>,
    pub write_mode: Option<WriteMode>,
}

enum Command {
    StartScan(ScanMode, oneshot::Sender<Result<(), SerialError>>),
    StopScan(oneshot::Sender<()>),
    Connect(Peripheral, oneshot::Sender<Result<(), SerialError>>),
    Disconnect(oneshot::Sender<Result<(), SerialError>>),
    Send(Vec<u8>, oneshot::Sender<Result<(), SerialError>>),
    ReadRssi(oneshot::Sender<Result<(), SerialError>>),
    Status(oneshot::Sender<SessionStatus>),
}

/// Cloneable handle for issuing commands to a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub async fn start_scan(&self, mode: ScanMode) -> Result<(), SerialError> {
        self.request(|reply| Command::StartScan(mode, reply)).await?
    }

    pub async fn stop_scan(&self) -> Result<(), SerialError> {
        self.request(Command::StopScan).await
    }

    pub async fn connect(&self, peripheral: Peripheral) -> Result<(), SerialError> {
        self.request(|reply| Command::Connect(peripheral, reply)).await?
    }

    pub async fn disconnect(&self) -> Result<(), SerialError> {
        self.request(Command::Disconnect).await?
    }

    pub async fn send(&self, data: impl Into<Vec<u8>>) -> Result<(), SerialError> {
        let data = data.into();
        self.request(|reply| Command::Send(data, reply)).await?
    }

    pub async fn send_text(&self, message: &str) -> Result<(), SerialError> {
        self.send(message.as_bytes()).await
    }

    pub async fn read_rssi(&self) -> Result<(), SerialError> {
        self.request(Command::ReadRssi).await?
    }

    pub async fn status(&self) -> Result<SessionStatus, SerialError> {
        self.request(Command::Status).await
    }

    pub async fn is_ready(&self) -> bool {
        matches!(self.status().await, Ok(status) if status.state == ConnectionState::Ready)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SerialError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SerialError::SessionClosed)?;
        response.await.map_err(|_| SerialError::SessionClosed)
    }
}

/// Owns the task that drives a `BluetoothSerial`
pub struct SerialSession {
    handle: SessionHandle,
    cancel_token: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl SerialSession {
    /// Moves `serial` into a new task fed by `events`
    pub fn spawn<A: Adapter + 'static>(
        serial: BluetoothSerial<A>,
        events: mpsc::UnboundedReceiver<AdapterEvent>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(SESSION_COMMAND_CAPACITY);
        let cancel_token = CancellationToken::new();
        let cancel_token_for_task = cancel_token.clone();

        let task_handle = tokio::spawn(async move {
            Self::run(serial, events, commands_rx, cancel_token_for_task).await;
        });
        info!("Serial session started.");

        Self {
            handle: SessionHandle { commands: commands_tx },
            cancel_token,
            task_handle: Some(task_handle),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Stops the loop and waits for the task to finish
    pub async fn shutdown(&mut self) {
        info!("Stopping serial session.");
        self.cancel_token.cancel();

        if let Some(handle) = self.task_handle.take() {
            match handle.await {
                Ok(()) => info!("Serial session finished."),
                Err(e) if e.is_cancelled() => info!("Serial session task was cancelled."),
                Err(e) => error!("Serial session finished with an unexpected join error: {:?}", e),
            }
        }
    }

    async fn run<A: Adapter>(
        mut serial: BluetoothSerial<A>,
        mut events: mpsc::UnboundedReceiver<AdapterEvent>,
        mut commands: mpsc::Receiver<Command>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            debug!("Adapter event: {:?}", event);
                            serial.handle_event(event);
                        }
                        None => {
                            info!("Adapter event stream has ended.");
                            break;
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => Self::apply(&mut serial, command),
                        None => {
                            info!("All session handles dropped.");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn apply<A: Adapter>(serial: &mut BluetoothSerial<A>, command: Command) {
        // A caller that stopped waiting for its reply is not an error.
        match command {
            Command::StartScan(mode, reply) => {
                let _ = reply.send(serial.start_scan(mode));
            }
            Command::StopScan(reply) => {
                serial.stop_scan();
                let _ = reply.send(());
            }
            Command::Connect(peripheral, reply) => {
                let _ = reply.send(serial.connect(peripheral));
            }
            Command::Disconnect(reply) => {
                let _ = reply.send(serial.disconnect());
            }
            Command::Send(data, reply) => {
                let _ = reply.send(serial.send(&data));
            }
            Command::ReadRssi(reply) => {
                let _ = reply.send(serial.read_rssi());
            }
            Command::Status(reply) => {
                let _ = reply.send(SessionStatus {
                    state: serial.state().clone(),
                    adapter_state: serial.adapter_state(),
                    scanning: serial.is_scanning(),
                    pending: serial.pending_peripheral().cloned(),
                    connected: serial.connected_peripheral().cloned(),
                    write_mode: serial.write_mode(),
                });
            }
        }
    }
}
