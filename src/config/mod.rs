pub mod uuid_format;

use std::path::Path;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::core::serial::{ScanMode, UUID_SERIAL_CHARACTERISTIC, UUID_SERIAL_SERVICE};
use crate::utils::ensure_directory_exists;

pub const CONFIG_FILE_NAME: &str = "serial_config.json";

/// Identifiers and scan behaviour of the serial connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Service the module exposes; scans and service discovery are filtered on it
    #[serde(with = "uuid_format")]
    pub service_uuid: Uuid,
    /// Characteristic inside the service used for notify and write
    #[serde(with = "uuid_format")]
    pub characteristic_uuid: Uuid,
    /// Whether scans report every peripheral or only ones advertising the service
    pub scan_mode: ScanMode,
    /// Update the recorded signal strength when a known peripheral is seen again
    pub refresh_rssi: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            service_uuid: UUID_SERIAL_SERVICE,
            characteristic_uuid: UUID_SERIAL_CHARACTERISTIC,
            scan_mode: ScanMode::ServiceFiltered,
            refresh_rssi: false,
        }
    }
}

impl SerialConfig {
    /// Loads the config from a JSON file, falling back to defaults when it is missing.
    pub async fn load_config(file_path: impl AsRef<Path>) -> Result<Self> {
        let file_path = file_path.as_ref();

        if !file_path.exists() {
            warn!("Serial config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Serial config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the config as pretty JSON, creating the parent directory if needed.
    pub async fn save_config(&self, file_path: impl AsRef<Path>) -> Result<()> {
        let file_path = file_path.as_ref();
        if let Some(config_dir) = file_path.parent() {
            ensure_directory_exists(config_dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize serial config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;
        info!("Serial config saved to {:?}", file_path);
        Ok(())
    }

    /// Service filter for a scan in the configured mode
    pub fn scan_filter(&self) -> Vec<Uuid> {
        self.scan_mode.filter(self.service_uuid)
    }
}
