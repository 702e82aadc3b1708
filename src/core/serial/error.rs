//! Errors reported by the serial connection

use thiserror::Error;
use uuid::Uuid;

use crate::core::serial::types::PeripheralId;

/// Which part of the discovery chain came back empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingAttribute {
    Service(Uuid),
    Characteristic(Uuid),
}

/// Failures local to one scan or connection attempt. None of them is fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerialError {
    #[error("bluetooth adapter is not powered on")]
    AdapterNotReady,

    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("discovery on {peripheral} finished without {missing}")]
    DiscoveryIncomplete {
        peripheral: PeripheralId,
        missing: MissingAttribute,
    },

    #[error("a connection is already pending or active")]
    Busy,

    #[error("serial link is not ready")]
    NotReady,

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("serial session has shut down")]
    SessionClosed,
}

impl std::fmt::Display for MissingAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service(uuid) => write!(f, "service {}", uuid),
            Self::Characteristic(uuid) => write!(f, "characteristic {}", uuid),
        }
    }
}
